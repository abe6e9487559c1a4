use crate::output::print_json;
use vigil_core::classifier::classify;

pub fn run(code: Option<u16>, message: &str, json: bool) -> anyhow::Result<()> {
    let category = classify(code, message);
    if json {
        return print_json(&serde_json::json!({
            "code": code,
            "message": message,
            "category": category,
            "retryable": !category.is_terminal(),
        }));
    }
    println!("{category}");
    Ok(())
}
