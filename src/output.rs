use anyhow::{Context, Result};
use log::info;
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

/// Read a JSON document from `path`, or from stdin when no path is given and
/// input is piped.
pub fn read_json_input(path: Option<&Path>) -> Result<Value> {
    let (content, origin) = match path {
        Some(p) => {
            let content = fs::read_to_string(p)
                .with_context(|| format!("Failed to read input file: {}", p.display()))?;
            (content, p.display().to_string())
        }
        None => {
            if atty::is(atty::Stream::Stdin) {
                anyhow::bail!("No input given: pass --in <file> or pipe JSON on stdin");
            }
            let mut content = String::new();
            io::stdin()
                .read_to_string(&mut content)
                .context("Failed to read stdin")?;
            (content, "stdin".to_string())
        }
    };

    parse_json(&content, &origin)
}

fn parse_json(content: &str, origin: &str) -> Result<Value> {
    serde_json::from_str(content).with_context(|| format!("Failed to parse JSON from {}", origin))
}

/// Pretty-print `value` to `path`, or stdout when no path is given.
pub fn write_json<T: Serialize + ?Sized>(path: Option<&Path>, value: &T) -> Result<()> {
    let mut json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    json.push('\n');
    write_text(path, &json)
}

pub fn write_text(path: Option<&Path>, text: &str) -> Result<()> {
    let Some(path) = path else {
        let mut stdout = io::stdout().lock();
        stdout
            .write_all(text.as_bytes())
            .and_then(|_| stdout.flush())
            .context("Failed to write to stdout")?;
        return Ok(());
    };

    // Ensure directory exists
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {}", parent.display()))?;
    }

    fs::write(path, text)
        .with_context(|| format!("Failed to write output file: {}", path.display()))?;

    info!("Wrote {}", path.display());
    Ok(())
}
