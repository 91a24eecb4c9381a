// klippy_nozzle_fan/src/gcode.rs
// G-code command parsing and dispatch.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum CommandError {
    Parse(String),
    UnknownCommand(String),
    DuplicateCommand(String),
    GCodeError(String),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Parse(msg) => write!(f, "Malformed command: {}", msg),
            CommandError::UnknownCommand(cmd) => write!(f, "Unknown command:\"{}\"", cmd),
            CommandError::DuplicateCommand(cmd) => {
                write!(f, "gcode command {} already registered", cmd)
            }
            CommandError::GCodeError(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for CommandError {}

/// A parsed command line. Traditional commands (`M106 S128`) store each
/// parameter under its letter; extended commands (`SET_NOZZLE_FAN SPEED=.5`)
/// store `KEY=VALUE` pairs. Keys are uppercase.
#[derive(Debug)]
pub struct GCodeCommand {
    pub command: String,
    pub raw_line: String,
    params: HashMap<String, String>,
    responses: RefCell<Vec<String>>,
}

impl GCodeCommand {
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let clean_line = line.split(';').next().unwrap_or("").trim();
        let mut parts = clean_line.split_whitespace();
        let command = parts
            .next()
            .ok_or_else(|| CommandError::Parse("empty line".to_string()))?
            .to_uppercase();

        let mut chars = command.chars();
        let is_traditional = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
            && chars.clone().next().is_some()
            && chars.all(|c| c.is_ascii_digit() || c == '.');

        let mut params = HashMap::new();
        for part in parts {
            if is_traditional {
                let mut letters = part.chars();
                let letter = letters
                    .next()
                    .filter(|c| c.is_ascii_alphabetic())
                    .ok_or_else(|| {
                        CommandError::Parse(format!("bad parameter '{}' in '{}'", part, line))
                    })?;
                params.insert(
                    letter.to_ascii_uppercase().to_string(),
                    letters.as_str().to_string(),
                );
            } else {
                let (key, value) = part.split_once('=').ok_or_else(|| {
                    CommandError::Parse(format!(
                        "expected KEY=VALUE, got '{}' in '{}'",
                        part, line
                    ))
                })?;
                if key.is_empty() {
                    return Err(CommandError::Parse(format!("empty parameter name in '{}'", line)));
                }
                params.insert(key.to_uppercase(), value.to_string());
            }
        }

        Ok(GCodeCommand {
            command,
            raw_line: line.to_string(),
            params,
            responses: RefCell::new(Vec::new()),
        })
    }

    pub fn get(&self, name: &str, default: Option<&str>) -> Result<String, CommandError> {
        match self.params.get(&name.to_uppercase()) {
            Some(value) => Ok(value.clone()),
            None => default.map(str::to_string).ok_or_else(|| {
                CommandError::GCodeError(format!("Error on '{}': missing {}", self.raw_line, name))
            }),
        }
    }

    pub fn get_float(
        &self,
        name: &str,
        default: Option<f64>,
        minval: Option<f64>,
        maxval: Option<f64>,
    ) -> Result<f64, CommandError> {
        let value = match self.params.get(&name.to_uppercase()) {
            Some(raw) => raw.parse::<f64>().ok().filter(|v| v.is_finite()).ok_or_else(|| {
                CommandError::GCodeError(format!(
                    "Unable to parse '{}' as a float for {}",
                    raw, name
                ))
            })?,
            None => default.ok_or_else(|| {
                CommandError::GCodeError(format!("Error on '{}': missing {}", self.raw_line, name))
            })?,
        };
        if let Some(min) = minval {
            if value < min {
                return Err(CommandError::GCodeError(format!(
                    "Error on '{}': {} must have minimum of {}", self.raw_line, name, min
                )));
            }
        }
        if let Some(max) = maxval {
            if value > max {
                return Err(CommandError::GCodeError(format!(
                    "Error on '{}': {} must have maximum of {}", self.raw_line, name, max
                )));
            }
        }
        Ok(value)
    }

    pub fn respond_info(&self, msg: &str) {
        log::info!("{}", msg);
        self.responses.borrow_mut().push(msg.to_string());
    }

    pub fn take_responses(&self) -> Vec<String> {
        self.responses.take()
    }
}

pub type GCodeHandler = Arc<dyn Fn(&GCodeCommand) -> Result<(), CommandError> + Send + Sync>;

struct RegisteredCommand {
    handler: GCodeHandler,
    description: Option<String>,
}

/// Command name -> handler registry.
#[derive(Default)]
pub struct GCodeDispatch {
    commands: HashMap<String, RegisteredCommand>,
}

impl GCodeDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_command(
        &mut self,
        name: &str,
        handler: GCodeHandler,
        description: Option<&str>,
    ) -> Result<(), CommandError> {
        let key = name.to_uppercase();
        if self.commands.contains_key(&key) {
            return Err(CommandError::DuplicateCommand(key));
        }
        self.commands.insert(
            key,
            RegisteredCommand {
                handler,
                description: description.map(str::to_string),
            },
        );
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<GCodeHandler> {
        self.commands.get(&name.to_uppercase()).map(|cmd| cmd.handler.clone())
    }

    /// `(name, description)` pairs sorted by name.
    pub fn help(&self) -> Vec<(String, String)> {
        let mut entries: Vec<_> = self
            .commands
            .iter()
            .map(|(name, cmd)| (name.clone(), cmd.description.clone().unwrap_or_default()))
            .collect();
        entries.sort();
        entries
    }
}
