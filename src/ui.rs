use colored::Colorize;
use declarative::{Action, ItemState, LogItem};

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

// ============================================================================
// Log Items
// ============================================================================

/// Print one log item line, colored by state and action
pub fn log_item(item: &LogItem) {
    let line = item.to_string();
    let line = match (item.state, item.action) {
        (ItemState::Error, _) => line.red(),
        (_, Action::Remove) => line.yellow(),
        (ItemState::Pending, _) => line.cyan(),
        (ItemState::Success, _) => line.normal(),
    };
    println!("{line}");
}

/// Print the diff lines of a log item, indented
pub fn log_diff(item: &LogItem) {
    for change in item.diff.iter().chain(&item.connections_diff) {
        for line in change.to_string().lines() {
            let colored = match line.chars().next() {
                Some('+') => line.green(),
                Some('-') => line.red(),
                _ => line.normal(),
            };
            println!("    {colored}");
        }
    }
}
