use std::{fs, path::PathBuf};

pub fn markdown_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut table = format!("| {} |\n", headers.join(" | "));
    table.push_str(&format!("|{}\n", " --- |".repeat(headers.len())));
    for row in rows {
        table.push_str(&format!("| {} |\n", row.join(" | ")));
    }
    table
}

/// Replaces (or appends) the `section` block of `benchmarks/RESULTS.md`.
pub fn update_results(section: &str, content: &str) -> std::io::Result<PathBuf> {
    let tag = section.to_uppercase().replace(' ', "_");
    let start = format!("<!-- {tag}_START -->");
    let end = format!("<!-- {tag}_END -->");
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("benchmarks/RESULTS.md");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut body = fs::read_to_string(&path)
        .unwrap_or_else(|_| "# Attention backend agreement\n\n".to_string());
    let block = format!("{start}\n{content}\n{end}\n");
    match (body.find(&start), body.find(&end)) {
        (Some(from), Some(to)) => body.replace_range(from..to + end.len() + 1, &block),
        _ => {
            if !body.ends_with('\n') {
                body.push('\n');
            }
            body.push_str(&block);
        }
    }
    fs::write(&path, body)?;
    Ok(path)
}
