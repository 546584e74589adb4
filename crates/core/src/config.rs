//! Read and edit the model's namelist-style configuration file
//!
//! The external program reads a plain-text config made of parameter groups:
//! a group opens with an `&NAME` heading line, closes with a lone `/`, and
//! holds one `KEY = value` parameter per line. The file is treated as an
//! opaque, round-trippable line store: edits rewrite only the targeted line
//! and an untouched read→write pass reproduces the input byte-for-byte.

use rustc_hash::FxHashMap;
use std::fs;
use std::path::Path;

/// A parameter value, typed by syntax at parse time
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Integer(i64),
    Float(f64),
    Flag(bool),
    Text(String),
}

impl ConfigValue {
    /// Infer a value from its raw text form
    ///
    /// Integer literals become `Integer`, decimal/exponent literals `Float`,
    /// Fortran logicals (`T`, `F`, `.TRUE.`, `.FALSE.`) `Flag`, and anything
    /// else `Text` (surrounding single quotes stripped).
    pub fn infer(raw: &str) -> Self {
        let trimmed = raw.trim();
        let upper = trimmed.to_uppercase();
        if matches!(upper.as_str(), "T" | ".TRUE.") {
            return ConfigValue::Flag(true);
        }
        if matches!(upper.as_str(), "F" | ".FALSE.") {
            return ConfigValue::Flag(false);
        }
        if trimmed
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit() || c == '+' || c == '-' || c == '.')
        {
            if let Ok(i) = trimmed.parse::<i64>() {
                return ConfigValue::Integer(i);
            }
            if let Ok(x) = trimmed.parse::<f64>() {
                if x.is_finite() {
                    return ConfigValue::Float(x);
                }
            }
        }
        let text = trimmed
            .strip_prefix('\'')
            .and_then(|s| s.strip_suffix('\''))
            .unwrap_or(trimmed);
        ConfigValue::Text(text.to_string())
    }

    /// Checked integer access
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ConfigValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Checked float access; integers widen to float
    pub fn as_float(&self) -> Option<f64> {
        match self {
            ConfigValue::Float(x) => Some(*x),
            ConfigValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Checked flag access
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            ConfigValue::Flag(b) => Some(*b),
            _ => None,
        }
    }

    /// Checked text access
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ConfigValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Name of the value's type, for diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            ConfigValue::Integer(_) => "integer",
            ConfigValue::Float(_) => "float",
            ConfigValue::Flag(_) => "flag",
            ConfigValue::Text(_) => "text",
        }
    }
}

impl std::fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigValue::Integer(i) => write!(f, "{i}"),
            ConfigValue::Float(x) => write!(f, "{x}"),
            ConfigValue::Flag(true) => write!(f, "T"),
            ConfigValue::Flag(false) => write!(f, "F"),
            ConfigValue::Text(s) => write!(f, "{s}"),
        }
    }
}

/// One (group, key, value) edit, as applied by [`ConfigFile::apply_edits`]
#[derive(Debug, Clone)]
pub struct ConfigEdit {
    pub group: String,
    pub key: String,
    pub value: ConfigValue,
}

impl ConfigEdit {
    pub fn new(group: impl Into<String>, key: impl Into<String>, value: ConfigValue) -> Self {
        Self {
            group: group.into(),
            key: key.into(),
            value,
        }
    }
}

/// Behavior of [`ConfigFile::set`] on a key the file does not contain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetMode {
    /// Unknown keys fail with `ConfigError::UnknownKey`
    #[default]
    Strict,
    /// Unknown keys are appended at the end of their group (the group is
    /// created at the end of the file if needed)
    Insert,
}

/// A loaded configuration file with an index of its parameters
#[derive(Debug, Clone)]
pub struct ConfigFile {
    lines: Vec<String>,
    trailing_newline: bool,
    // (GROUP, KEY) -> line number, both uppercased, group without '&'
    index: FxHashMap<(String, String), usize>,
    // (GROUP, heading line, closing '/' line), in file order
    groups: Vec<(String, usize, usize)>,
    mode: SetMode,
}

fn normalize_group(name: &str) -> String {
    name.trim().trim_start_matches('&').to_uppercase()
}

impl ConfigFile {
    /// Read and index a configuration file
    ///
    /// # Errors
    /// Returns `ConfigError::Io` on read failure and `ConfigError::Parse`
    /// (with a 1-based line number) on malformed content.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::parse(&contents)
    }

    /// Parse configuration text
    ///
    /// # Errors
    /// Returns `ConfigError::Parse` with a 1-based line number on malformed
    /// content.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let lines: Vec<String> = contents.lines().map(String::from).collect();
        let mut file = Self {
            lines,
            trailing_newline: contents.ends_with('\n') || contents.is_empty(),
            index: FxHashMap::default(),
            groups: Vec::new(),
            mode: SetMode::Strict,
        };
        file.reindex()?;
        Ok(file)
    }

    /// Set the unknown-key behavior used by [`set`](Self::set)
    pub fn with_mode(mut self, mode: SetMode) -> Self {
        self.mode = mode;
        self
    }

    fn reindex(&mut self) -> Result<(), ConfigError> {
        self.index.clear();
        self.groups.clear();

        let mut open: Option<(String, usize)> = None;
        for (i, raw) in self.lines.iter().enumerate() {
            let line = raw.trim();
            if let Some((group, start)) = open.clone() {
                if line == "/" {
                    self.groups.push((group, start, i));
                    open = None;
                } else if line.is_empty() || line.starts_with('!') {
                    // blank and comment lines are preserved but not indexed
                } else if let Some(eq) = line.find('=') {
                    let key = line[..eq].trim().to_uppercase();
                    if key.is_empty() {
                        return Err(ConfigError::Parse {
                            line: i + 1,
                            reason: "parameter line with empty key".to_string(),
                        });
                    }
                    let slot = (group.clone(), key.clone());
                    if self.index.insert(slot, i).is_some() {
                        return Err(ConfigError::Parse {
                            line: i + 1,
                            reason: format!("duplicate parameter {key} in group &{group}"),
                        });
                    }
                } else {
                    return Err(ConfigError::Parse {
                        line: i + 1,
                        reason: "expected KEY = value, '/' or comment".to_string(),
                    });
                }
            } else if line.is_empty() || line.starts_with('!') {
                // preamble whitespace and comments
            } else if let Some(name) = line.strip_prefix('&') {
                let group = normalize_group(name);
                if group.is_empty() {
                    return Err(ConfigError::Parse {
                        line: i + 1,
                        reason: "group heading with empty name".to_string(),
                    });
                }
                if self.groups.iter().any(|(g, _, _)| *g == group) {
                    return Err(ConfigError::Parse {
                        line: i + 1,
                        reason: format!("duplicate group &{group}"),
                    });
                }
                open = Some((group, i));
            } else {
                return Err(ConfigError::Parse {
                    line: i + 1,
                    reason: "content outside a parameter group".to_string(),
                });
            }
        }

        if let Some((group, start)) = open {
            return Err(ConfigError::Parse {
                line: start + 1,
                reason: format!("group &{group} is never closed with '/'"),
            });
        }
        Ok(())
    }

    /// Typed value of a parameter
    ///
    /// # Errors
    /// Returns `ConfigError::UnknownKey` if the group/key pair is not in
    /// the file.
    pub fn get(&self, group: &str, key: &str) -> Result<ConfigValue, ConfigError> {
        let line = self.line_of(group, key)?;
        let raw = &self.lines[line];
        // line_of only returns lines the indexer accepted, which contain '='
        let value = match raw.find('=') {
            Some(eq) => &raw[eq + 1..],
            None => "",
        };
        Ok(ConfigValue::infer(value))
    }

    /// Integer value of a parameter
    ///
    /// # Errors
    /// `UnknownKey` if missing, `TypeMismatch` if the value is not an integer.
    pub fn get_integer(&self, group: &str, key: &str) -> Result<i64, ConfigError> {
        let value = self.get(group, key)?;
        value.as_integer().ok_or(ConfigError::TypeMismatch {
            expected: "integer",
            found: value.type_name(),
        })
    }

    /// Float value of a parameter (integers widen)
    ///
    /// # Errors
    /// `UnknownKey` if missing, `TypeMismatch` if the value is not numeric.
    pub fn get_float(&self, group: &str, key: &str) -> Result<f64, ConfigError> {
        let value = self.get(group, key)?;
        value.as_float().ok_or(ConfigError::TypeMismatch {
            expected: "float",
            found: value.type_name(),
        })
    }

    /// Replace the value of a parameter, preserving everything left of `=`
    ///
    /// Unknown keys follow the configured [`SetMode`].
    ///
    /// # Errors
    /// `ConfigError::UnknownKey` in `Strict` mode when the key is missing.
    pub fn set(&mut self, group: &str, key: &str, value: &ConfigValue) -> Result<(), ConfigError> {
        match self.line_of(group, key) {
            Ok(line) => {
                let new_line = {
                    let raw = &self.lines[line];
                    let prefix = match raw.find('=') {
                        Some(eq) => &raw[..=eq],
                        None => raw.as_str(),
                    };
                    format!("{prefix} {value}")
                };
                self.lines[line] = new_line;
                Ok(())
            }
            Err(err) => match self.mode {
                SetMode::Strict => Err(err),
                SetMode::Insert => self.insert(group, key, value),
            },
        }
    }

    fn insert(&mut self, group: &str, key: &str, value: &ConfigValue) -> Result<(), ConfigError> {
        let group_name = normalize_group(group);
        let key_name = key.trim().to_uppercase();
        let new_line = format!("  {key_name} = {value}");

        if let Some((_, _, close)) = self.groups.iter().find(|(g, _, _)| *g == group_name) {
            self.lines.insert(*close, new_line);
        } else {
            self.lines.push(format!("&{group_name}"));
            self.lines.push(new_line);
            self.lines.push("/".to_string());
        }
        self.reindex()
    }

    /// Apply a batch of edits plus an optional caption in one pass
    ///
    /// The caption parameter identifies the created configuration and lives
    /// at `&GETBASIC CAPTION`.
    ///
    /// # Errors
    /// Propagates the first failing [`set`](Self::set).
    pub fn apply_edits(
        &mut self,
        edits: &[ConfigEdit],
        caption: Option<&str>,
    ) -> Result<(), ConfigError> {
        for edit in edits {
            self.set(&edit.group, &edit.key, &edit.value)?;
        }
        if let Some(caption) = caption {
            self.set(
                presets::CAPTION_GROUP,
                presets::CAPTION_KEY,
                &ConfigValue::Text(caption.to_string()),
            )?;
        }
        Ok(())
    }

    /// Serialize the (possibly edited) file
    ///
    /// # Errors
    /// Returns `ConfigError::Io` on write failure.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path, self.to_text()).map_err(|e| ConfigError::Io(e.to_string()))
    }

    /// The file contents as they would be written
    pub fn to_text(&self) -> String {
        let mut out = self.lines.join("\n");
        if self.trailing_newline && !self.lines.is_empty() {
            out.push('\n');
        }
        out
    }

    /// Group names in file order, without the `&` prefix
    pub fn group_names(&self) -> Vec<&str> {
        self.groups.iter().map(|(g, _, _)| g.as_str()).collect()
    }

    fn line_of(&self, group: &str, key: &str) -> Result<usize, ConfigError> {
        let slot = (normalize_group(group), key.trim().to_uppercase());
        self.index
            .get(&slot)
            .copied()
            .ok_or_else(|| ConfigError::UnknownKey {
                group: slot.0.clone(),
                key: slot.1.clone(),
            })
    }
}

/// Named preset edit tables carried over from the production configuration
pub mod presets {
    use super::{ConfigEdit, ConfigValue};

    pub const CAPTION_GROUP: &str = "GETBASIC";
    pub const CAPTION_KEY: &str = "CAPTION";

    fn edits(group: &str, keys: &[&str], values: &[ConfigValue]) -> Vec<ConfigEdit> {
        keys.iter()
            .zip(values)
            .map(|(key, value)| ConfigEdit::new(group, *key, value.clone()))
            .collect()
    }

    /// Look up a preset by family (`fuel`, `risk`, `sup`) and option name
    pub fn preset(family: &str, name: &str) -> Option<Vec<ConfigEdit>> {
        use ConfigValue::{Float, Integer};
        match family {
            "fuel" => {
                let keys = ["IMMATURE_FUEL_FACTOR", "MATURE_FUEL_FACTOR"];
                let immature = match name {
                    "1-04" => 1.0,
                    "1p5-04" => 1.5,
                    "2-04" => 2.0,
                    "2p5-04" => 2.5,
                    "3-04" => 3.0,
                    "4-04" => 4.0,
                    "6-04" => 6.0,
                    "8-04" => 8.0,
                    _ => return None,
                };
                Some(edits(
                    "GETFUEL",
                    &keys,
                    &[Float(immature), Float(0.4)],
                ))
            }
            "risk" => {
                let keys = [
                    "NO_FREQ", "LO_FREQ", "MOD_FREQ", "HI_FREQ", "VHI_FREQ", "EX_FREQ",
                ];
                let freqs: [i64; 6] = match name {
                    "Def" => [0, 540, 250, 65, 5, 1],
                    "ONLY_L" => [0, 100, 0, 0, 0, 0],
                    "ONLY_M" => [0, 0, 100, 0, 0, 0],
                    "ONLY_H" => [0, 0, 0, 100, 0, 0],
                    "ONLY_E" => [0, 0, 0, 0, 100, 100],
                    _ => return None,
                };
                let values: Vec<ConfigValue> = freqs.iter().map(|&v| Integer(v)).collect();
                Some(edits("GETSTATES", &keys, &values))
            }
            "sup" => {
                let keys = ["BEGIN_AT_STEP", "CANCEL_AT_STEP"];
                let steps: [i64; 2] = match name {
                    "SUP" => [0, 9000],
                    "NOSUP" => [9000, 9001],
                    _ => return None,
                };
                let values: Vec<ConfigValue> = steps.iter().map(|&v| Integer(v)).collect();
                Some(edits("GETSUPPRESS", &keys, &values))
            }
            _ => None,
        }
    }
}

/// Errors raised while reading, editing, or writing a configuration file
#[derive(Debug)]
pub enum ConfigError {
    /// File could not be read or written
    Io(String),
    /// Malformed content at a 1-based line number
    Parse { line: usize, reason: String },
    /// Group/key pair not present in the file
    UnknownKey { group: String, key: String },
    /// A typed accessor found a value of the wrong type
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(msg) => write!(f, "config I/O failed: {msg}"),
            ConfigError::Parse { line, reason } => {
                write!(f, "config parse failed at line {line}: {reason}")
            }
            ConfigError::UnknownKey { group, key } => {
                write!(f, "unknown config parameter &{group} {key}")
            }
            ConfigError::TypeMismatch { expected, found } => {
                write!(f, "config value type mismatch: expected {expected}, found {found}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
