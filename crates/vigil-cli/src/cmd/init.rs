use crate::output::print_json;
use anyhow::Context;
use std::path::Path;
use vigil_core::{config::Config, io, paths, store::Store};

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let dir = paths::vigil_dir(root);
    io::ensure_dir(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let config_created = if paths::config_path(root).exists() {
        false
    } else {
        Config::default()
            .save(root)
            .context("failed to write config.yaml")?;
        true
    };

    let db = paths::db_path(root);
    let store_created = !db.exists();
    Store::open(&db).with_context(|| format!("failed to open {}", db.display()))?;

    if json {
        return print_json(&serde_json::json!({
            "root": root.display().to_string(),
            "config_created": config_created,
            "store_created": store_created,
        }));
    }

    println!("Initializing vigil in: {}", root.display());
    println!(
        "  {} .vigil/config.yaml",
        if config_created { "created:" } else { "exists: " }
    );
    println!(
        "  {} .vigil/vigil.redb",
        if store_created { "created:" } else { "exists: " }
    );
    Ok(())
}
