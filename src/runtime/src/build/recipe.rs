//! Recipe parser.
//!
//! Parses recipe text into an ordered list of build steps. Supports
//! `BASE_IMAGE` (alias `FROM`), `RUN` (single-line or heredoc block) and
//! `ENV`, plus line continuations (`\`), comments, and blank lines.

use std::fmt;
use std::path::Path;

use stratum_core::error::{BuildError, Result};

/// A single recipe instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// `BASE_IMAGE <ref>`
    BaseImage { reference: String },
    /// `RUN <command>` or a `RUN <<MARKER` block, one entry per command line
    Run { commands: Vec<String> },
    /// `ENV <key>=<value>` or `ENV <key> <value>`
    Env { key: String, value: String },
}

impl Instruction {
    /// Stable textual form hashed into cache keys and layer ids.
    pub fn canonical(&self) -> String {
        match self {
            Instruction::BaseImage { reference } => format!("BASE_IMAGE {}", reference),
            Instruction::Run { commands } => format!("RUN {}", commands.join("\n")),
            Instruction::Env { key, value } => format!("ENV {}={}", key, value),
        }
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            Instruction::BaseImage { .. } => "BASE_IMAGE",
            Instruction::Run { .. } => "RUN",
            Instruction::Env { .. } => "ENV",
        }
    }
}

impl fmt::Display for Instruction {
    /// Single-line summary used in progress output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Run { commands } if commands.len() > 1 => {
                write!(f, "RUN {} (+{} more lines)", commands[0], commands.len() - 1)
            }
            other => write!(f, "{}", other.canonical()),
        }
    }
}

/// An instruction and the 1-based line on which it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub line: usize,
    pub instruction: Instruction,
}

/// Parsed recipe: the steps in source order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipe {
    pub steps: Vec<Step>,
}

impl Recipe {
    /// Parse a recipe from its text content.
    pub fn parse(content: &str) -> Result<Self> {
        let lines: Vec<&str> = content.lines().collect();
        let mut steps = Vec::new();
        let mut idx = 0;

        while idx < lines.len() {
            let line_num = idx + 1;
            let trimmed = lines[idx].trim();

            // Skip empty lines and comments
            if trimmed.is_empty() || trimmed.starts_with('#') {
                idx += 1;
                continue;
            }

            let (logical, next) = join_continuation_lines(&lines, idx);
            idx = next;

            let (keyword, rest) = split_first_word(&logical);
            if keyword.eq_ignore_ascii_case("RUN") && rest.starts_with("<<") {
                let (commands, next) = parse_heredoc(&lines, idx, rest, line_num)?;
                idx = next;
                steps.push(Step {
                    line: line_num,
                    instruction: Instruction::Run { commands },
                });
                continue;
            }

            let instruction = parse_instruction(keyword, rest, line_num)?;
            steps.push(Step {
                line: line_num,
                instruction,
            });
        }

        validate(&steps)?;
        Ok(Recipe { steps })
    }

    /// Parse a recipe from a file path.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BuildError::Config(format!(
                "Failed to read recipe at {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }

    /// Reference named by the leading `BASE_IMAGE`.
    pub fn base_reference(&self) -> &str {
        match self.steps.first().map(|s| &s.instruction) {
            Some(Instruction::BaseImage { reference }) => reference,
            _ => "",
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

fn validate(steps: &[Step]) -> Result<()> {
    let first = steps.first().ok_or_else(|| BuildError::Syntax {
        line: 1,
        reason: "recipe is empty or contains no instructions".to_string(),
    })?;

    if !matches!(first.instruction, Instruction::BaseImage { .. }) {
        return Err(BuildError::Syntax {
            line: first.line,
            reason: "first instruction must be BASE_IMAGE".to_string(),
        });
    }

    if let Some(repeat) = steps
        .iter()
        .skip(1)
        .find(|s| matches!(s.instruction, Instruction::BaseImage { .. }))
    {
        return Err(BuildError::Syntax {
            line: repeat.line,
            reason: "BASE_IMAGE may appear only once (multi-stage builds are not supported)"
                .to_string(),
        });
    }

    Ok(())
}

/// Join physical lines ending with `\` into one logical line starting at
/// `start`. Returns the logical line and the index of the next physical line.
fn join_continuation_lines(lines: &[&str], start: usize) -> (String, usize) {
    let mut current = String::new();
    let mut idx = start;

    while idx < lines.len() {
        let line = lines[idx];
        idx += 1;
        match line.trim_end().strip_suffix('\\') {
            Some(body) => {
                current.push_str(body.trim_end());
                current.push(' ');
            }
            None => {
                current.push_str(line);
                break;
            }
        }
    }

    (current.trim().to_string(), idx)
}

/// Parse a single logical line into an Instruction.
fn parse_instruction(keyword: &str, rest: &str, line_num: usize) -> Result<Instruction> {
    match keyword.to_ascii_uppercase().as_str() {
        "BASE_IMAGE" | "FROM" => parse_base_image(rest, line_num),
        "RUN" => parse_run(rest, line_num),
        "ENV" => parse_env(rest, line_num),
        _ => Err(syntax(line_num, format!("unknown instruction '{}'", keyword))),
    }
}

/// Split a string into the first word and the rest.
fn split_first_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

fn syntax(line: usize, reason: impl Into<String>) -> BuildError {
    BuildError::Syntax {
        line,
        reason: reason.into(),
    }
}

// --- Individual instruction parsers ---

fn parse_base_image(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(syntax(line_num, "BASE_IMAGE requires an image reference"));
    }
    if rest.split_whitespace().count() > 1 {
        return Err(syntax(
            line_num,
            format!("BASE_IMAGE takes exactly one reference, got '{}'", rest),
        ));
    }
    Ok(Instruction::BaseImage {
        reference: rest.to_string(),
    })
}

fn parse_run(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(syntax(line_num, "RUN requires a command"));
    }
    Ok(Instruction::Run {
        commands: vec![rest.to_string()],
    })
}

fn parse_env(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(syntax(line_num, "ENV requires a key and value"));
    }

    // Two forms:
    // ENV KEY=VALUE  (or KEY="VALUE")
    // ENV KEY VALUE
    let eq_pos = rest.find('=');
    let space_pos = rest.find(char::is_whitespace);
    let (key, raw_value) = match (eq_pos, space_pos) {
        (Some(eq), None) => (&rest[..eq], &rest[eq + 1..]),
        (Some(eq), Some(space)) if eq < space => (&rest[..eq], &rest[eq + 1..]),
        _ => split_first_word(rest),
    };

    if !is_valid_env_key(key) {
        return Err(syntax(
            line_num,
            format!("invalid environment variable name '{}'", key),
        ));
    }
    if raw_value.trim().is_empty() {
        return Err(syntax(line_num, format!("ENV {} requires a value", key)));
    }

    Ok(Instruction::Env {
        key: key.to_string(),
        value: unquote(raw_value),
    })
}

fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parse a `RUN <<MARKER` block whose body starts at physical line `start`.
/// Returns the command lines and the index of the line after the closing marker.
fn parse_heredoc(
    lines: &[&str],
    start: usize,
    opener: &str,
    line_num: usize,
) -> Result<(Vec<String>, usize)> {
    let marker_text = &opener[2..];
    let (strip_tabs, marker_text) = match marker_text.strip_prefix('-') {
        Some(s) => (true, s),
        None => (false, marker_text),
    };
    let marker = unquote(marker_text);

    if marker.is_empty() {
        return Err(syntax(line_num, "heredoc requires a marker after '<<'"));
    }
    if !marker.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(syntax(
            line_num,
            format!("invalid heredoc marker '{}'", marker_text.trim()),
        ));
    }

    let mut commands = Vec::new();
    for (offset, raw) in lines[start..].iter().enumerate() {
        let line = if strip_tabs {
            raw.trim_start_matches('\t')
        } else {
            raw
        };
        if line.trim_end() == marker {
            if commands.is_empty() {
                return Err(syntax(line_num, "heredoc block has an empty body"));
            }
            return Ok((commands, start + offset + 1));
        }
        if !line.trim().is_empty() {
            commands.push(line.to_string());
        }
    }

    Err(syntax(
        line_num,
        format!("unterminated heredoc: missing closing '{}'", marker),
    ))
}

/// Remove surrounding quotes from a string.
fn unquote(s: &str) -> String {
    let s = s.trim();
    let quoted = s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"'))
            || (s.starts_with('\'') && s.ends_with('\'')));
    if quoted {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}
