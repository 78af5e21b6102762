//! Terminal tables

use tabled::settings::Style;
use tabled::{Table, Tabled};

/// Render `rows` as a table
pub fn render_table<T: Tabled>(rows: &[T]) -> String {
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    table.to_string()
}

/// Print a table followed by a `Total: N <noun>` line, or a notice when
/// there is nothing to show
pub fn display_table_with_count<T: Tabled>(rows: &[T], noun: &str) {
    if rows.is_empty() {
        println!("No {} found.", noun);
        return;
    }
    println!("{}", render_table(rows));
    println!("Total: {} {}", rows.len(), noun);
}
