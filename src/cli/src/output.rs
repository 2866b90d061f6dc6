//! Human-readable build output.

use comfy_table::{ContentArrangement, Table};
use stratum_runtime::build::BuildResult;
use stratum_runtime::cache::LayerStore;

/// Longest instruction text shown in a table cell.
const INSTRUCTION_WIDTH: usize = 48;

/// Create a borderless table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// One row per recipe step: position, instruction, cache status, layer, size.
pub fn step_table(result: &BuildResult, store: &LayerStore) -> Table {
    let mut table = new_table(&["STEP", "INSTRUCTION", "STATUS", "LAYER", "SIZE"]);
    for report in &result.steps {
        let (status, layer, size) = match &report.layer {
            Some(id) => {
                let size = store
                    .load(id)
                    .map(|l| format_bytes(l.size_bytes))
                    .unwrap_or_else(|_| "-".to_string());
                let status = if report.cache_hit { "cached" } else { "built" };
                (status, id.short().to_string(), size)
            }
            None => ("env", "-".to_string(), "-".to_string()),
        };
        table.add_row(vec![
            report.step.to_string(),
            truncate(&report.instruction, INSTRUCTION_WIDTH),
            status.to_string(),
            layer,
            size,
        ]);
    }
    table
}

pub fn summary_line(result: &BuildResult) -> String {
    format!(
        "{} layers ({} cached, {} built)",
        result.manifest.layers.len(),
        result.cached_steps(),
        result.executed_steps()
    )
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Collapse newlines and cut `s` to at most `max` characters.
pub fn truncate(s: &str, max: usize) -> String {
    let flat = s.replace('\n', " ; ");
    if flat.chars().count() <= max {
        return flat;
    }
    let kept: String = flat.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}
