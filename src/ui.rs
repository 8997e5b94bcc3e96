use colored::Colorize;

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
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

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

// ============================================================================
// Tables
// ============================================================================

/// Render rows as left-aligned columns separated by two spaces.
///
/// The last column is not padded.
pub fn render_table(headers: &[&str], rows: &[Vec<String>]) -> Vec<String> {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(width) = widths.get_mut(i) {
                *width = (*width).max(cell.chars().count());
            }
        }
    }

    let line = |cells: Vec<&str>| {
        let last = cells.len().saturating_sub(1);
        cells
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                if i == last {
                    (*cell).to_string()
                } else {
                    format!("{:<width$}", cell, width = widths[i])
                }
            })
            .collect::<Vec<_>>()
            .join("  ")
    };

    let mut out = Vec::with_capacity(rows.len() + 1);
    out.push(line(headers.to_vec()));
    for row in rows {
        out.push(line(row.iter().take(headers.len()).map(String::as_str).collect()));
    }
    out
}

/// Print a table with a bold header line
pub fn table(headers: &[&str], rows: &[Vec<String>]) {
    let mut lines = render_table(headers, rows).into_iter();
    if let Some(head) = lines.next() {
        println!("  {}", head.bold());
    }
    for line in lines {
        println!("  {line}");
    }
}

/// Placeholder for absent values
pub fn or_dash(value: Option<impl ToString>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_table_aligns_columns() {
        let rows = vec![
            vec!["101".to_string(), "h1-b178-s00".to_string(), "running".to_string()],
            vec!["9".to_string(), "c".to_string(), "stopped".to_string()],
        ];
        let lines = render_table(&["VMID", "NAME", "STATUS"], &rows);

        assert_eq!(lines[0], "VMID  NAME         STATUS");
        assert_eq!(lines[1], "101   h1-b178-s00  running");
        assert_eq!(lines[2], "9     c            stopped");
    }

    #[test]
    fn test_render_table_empty() {
        let lines = render_table(&["A", "B"], &[]);
        assert_eq!(lines, vec!["A  B"]);
    }

    #[test]
    fn test_or_dash() {
        assert_eq!(or_dash(None::<u32>), "-");
        assert_eq!(or_dash(Some(3)), "3");
    }
}
