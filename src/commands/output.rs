//! JSON output for `--format json`

use serde::Serialize;

/// Pretty-print `value` as JSON on stdout. A serialization failure is
/// reported on stderr naming `what`.
pub fn print_json<T: Serialize + ?Sized>(value: &T, what: &str) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing {} to JSON: {}", what, e),
    }
}

/// Print `{"<key>": value}`
pub fn print_json_wrapped<T: Serialize + ?Sized>(key: &str, value: &T, what: &str) {
    match serde_json::to_value(value) {
        Ok(inner) => print_json(&serde_json::json!({ key: inner }), what),
        Err(e) => eprintln!("Error serializing {} to JSON: {}", what, e),
    }
}
