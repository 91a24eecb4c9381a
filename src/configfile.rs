// klippy_nozzle_fan/src/configfile.rs
// Reads the printer configuration file and hands out typed option values.

use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    SectionNotFound(String),
    OptionNotFound(String, String),
    ParseError(String, String, String), // option, value, type_expected
    ValidationError(String),
    Syntax(String),
    Io(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::SectionNotFound(s) => write!(f, "Section not found: [{}]", s),
            ConfigError::OptionNotFound(s, o) => {
                write!(f, "Option '{}' in section '[{}]' must be specified", o, s)
            }
            ConfigError::ParseError(o, v, t) => {
                write!(f, "Unable to parse option '{}' value '{}' as {}", o, v, t)
            }
            ConfigError::ValidationError(msg) => write!(f, "{}", msg),
            ConfigError::Syntax(msg) => write!(f, "Config syntax error: {}", msg),
            ConfigError::Io(msg) => write!(f, "Unable to read config file: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Bounds applied by `getfloat`. `above` is an exclusive lower bound.
#[derive(Debug, Clone, Copy, Default)]
pub struct FloatBounds {
    pub minval: Option<f64>,
    pub maxval: Option<f64>,
    pub above: Option<f64>,
}

impl FloatBounds {
    pub fn fraction() -> Self {
        FloatBounds { minval: Some(0.0), maxval: Some(1.0), above: None }
    }

    pub fn non_negative() -> Self {
        FloatBounds { minval: Some(0.0), ..Default::default() }
    }

    pub fn positive() -> Self {
        FloatBounds { above: Some(0.0), ..Default::default() }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Configfile {
    // section_name -> { option_name -> raw value }, names stored lowercase
    data: HashMap<String, HashMap<String, String>>,
    filename: Option<String>,
}

impl Configfile {
    pub fn new(filename: Option<String>) -> Self {
        Configfile {
            data: HashMap::new(),
            filename,
        }
    }

    pub fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        let mut cf = Configfile::new(Some(path.display().to_string()));
        cf.parse(&content)?;
        log::debug!("Read config {} ({} sections)", path.display(), cf.data.len());
        Ok(cf)
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// Parses an INI-style configuration string, replacing any prior content.
    pub fn parse(&mut self, config_content: &str) -> Result<(), ConfigError> {
        self.data.clear();
        let mut current_section: Option<String> = None;

        for (lineno, line_raw) in config_content.lines().enumerate() {
            let line = match line_raw.find(|c: char| c == '#' || c == ';') {
                Some(index) => &line_raw[..index],
                None => line_raw,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                let name = line[1..line.len() - 1].trim().to_lowercase();
                if name.is_empty() {
                    return Err(ConfigError::Syntax(format!(
                        "empty section name on line {}",
                        lineno + 1
                    )));
                }
                self.data.entry(name.clone()).or_default();
                current_section = Some(name);
                continue;
            }

            let section = current_section.as_ref().ok_or_else(|| {
                ConfigError::Syntax(format!(
                    "line {} outside of a section: {}",
                    lineno + 1,
                    line_raw
                ))
            })?;
            // Whichever of '=' / ':' comes first separates key from value
            let split_at = line.find(|c: char| c == '=' || c == ':').ok_or_else(|| {
                ConfigError::Syntax(format!(
                    "malformed line {} in section [{}]: {}",
                    lineno + 1,
                    section,
                    line_raw
                ))
            })?;
            let key = line[..split_at].trim().to_lowercase();
            let value = line[split_at + 1..].trim().to_string();
            if key.is_empty() {
                return Err(ConfigError::Syntax(format!(
                    "empty key on line {} in section [{}]",
                    lineno + 1,
                    section
                )));
            }
            self.data.entry(section.clone()).or_default().insert(key, value);
        }
        Ok(())
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.data.contains_key(&section.to_lowercase())
    }

    pub fn get_str(&self, section: &str, option: &str) -> Result<&String, ConfigError> {
        self.data
            .get(&section.to_lowercase())
            .ok_or_else(|| ConfigError::SectionNotFound(section.to_string()))?
            .get(&option.to_lowercase())
            .ok_or_else(|| ConfigError::OptionNotFound(section.to_string(), option.to_string()))
    }

    /// Raw string option, falling back to `default` when the option is absent.
    pub fn get(
        &self,
        section: &str,
        option: &str,
        default: Option<&str>,
    ) -> Result<String, ConfigError> {
        match self.get_str(section, option) {
            Ok(value) => Ok(value.clone()),
            Err(ConfigError::OptionNotFound(..)) => default.map(str::to_string).ok_or_else(|| {
                ConfigError::OptionNotFound(section.to_string(), option.to_string())
            }),
            Err(e) => Err(e),
        }
    }

    /// Float option with an optional default. Present values are checked
    /// against `bounds`; defaults are trusted.
    pub fn getfloat(
        &self,
        section: &str,
        option: &str,
        default: Option<f64>,
        bounds: FloatBounds,
    ) -> Result<f64, ConfigError> {
        let raw = match self.get_str(section, option) {
            Ok(raw) => raw,
            Err(ConfigError::OptionNotFound(..)) => {
                return default.ok_or_else(|| {
                    ConfigError::OptionNotFound(section.to_string(), option.to_string())
                });
            }
            Err(e) => return Err(e),
        };
        let value = raw
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| {
                ConfigError::ParseError(option.to_string(), raw.clone(), "float".to_string())
            })?;

        if let Some(min) = bounds.minval {
            if value < min {
                return Err(ConfigError::ValidationError(format!(
                    "Option '{}' in section '[{}]' ({}) must have minimum of {}",
                    option, section, value, min
                )));
            }
        }
        if let Some(max) = bounds.maxval {
            if value > max {
                return Err(ConfigError::ValidationError(format!(
                    "Option '{}' in section '[{}]' ({}) must have maximum of {}",
                    option, section, value, max
                )));
            }
        }
        if let Some(above) = bounds.above {
            if value <= above {
                return Err(ConfigError::ValidationError(format!(
                    "Option '{}' in section '[{}]' ({}) must be above {}",
                    option, section, value, above
                )));
            }
        }
        Ok(value)
    }

    /// Like `getfloat`, but an absent option yields `None` instead of an error.
    pub fn getfloat_opt(
        &self,
        section: &str,
        option: &str,
        bounds: FloatBounds,
    ) -> Result<Option<f64>, ConfigError> {
        match self.getfloat(section, option, None, bounds) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigError::OptionNotFound(..)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn set(&mut self, section: &str, option: &str, value: &str) {
        self.data
            .entry(section.to_lowercase())
            .or_default()
            .insert(option.to_lowercase(), value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_parsed_config(content: &str) -> Configfile {
        let mut cf = Configfile::new(None);
        cf.parse(content).unwrap();
        cf
    }

    #[test]
    fn test_parse_simple_config() {
        let content =
            "[nozzle_cleaning_fan]\npin = PA8\nclean_speed: 0.8\n\n[printer]\nkinematics=cartesian";
        let cf = create_parsed_config(content);

        assert_eq!(cf.get("nozzle_cleaning_fan", "pin", None).unwrap(), "PA8");
        assert_eq!(cf.get("NOZZLE_CLEANING_FAN", "CLEAN_SPEED", None).unwrap(), "0.8");
        assert_eq!(cf.get("printer", "kinematics", None).unwrap(), "cartesian");
        assert!(cf.has_section("Printer"));
    }

    #[test]
    fn test_parse_with_comments_and_whitespace() {
        let content = r#"
# full line comment
[nozzle_cleaning_fan] ; trailing comment
  settle_time = 2.5 # trailing comment
  ramp_time:    0.25
  ; watchdog_time = 1
"#;
        let cf = create_parsed_config(content);
        let bounds = FloatBounds::default();
        assert_eq!(cf.getfloat("nozzle_cleaning_fan", "settle_time", None, bounds).unwrap(), 2.5);
        assert_eq!(cf.getfloat("nozzle_cleaning_fan", "ramp_time", None, bounds).unwrap(), 0.25);
        assert!(cf.get("nozzle_cleaning_fan", "watchdog_time", None).is_err());
    }

    #[test]
    fn test_getfloat_defaults_and_missing() {
        let cf = create_parsed_config("[fan]\nmax_power = 0.5");
        let bounds = FloatBounds::fraction();
        assert_eq!(cf.getfloat("fan", "max_power", Some(1.0), bounds).unwrap(), 0.5);
        assert_eq!(cf.getfloat("fan", "kick_start_time", Some(0.1), bounds).unwrap(), 0.1);
        assert_eq!(cf.getfloat_opt("fan", "post_clean_speed", bounds).unwrap(), None);
        assert!(matches!(
            cf.getfloat("fan", "clean_speed", None, bounds),
            Err(ConfigError::OptionNotFound(..))
        ));
        assert!(matches!(
            cf.getfloat("missing", "clean_speed", Some(1.0), bounds),
            Err(ConfigError::SectionNotFound(_))
        ));
    }

    #[test]
    fn test_getfloat_with_validation() {
        let cf = create_parsed_config("[validation]\nspeed = 1.5\nzero = 0\nbad = fast\nnan = NaN");

        match cf.getfloat("validation", "speed", None, FloatBounds::fraction()) {
            Err(ConfigError::ValidationError(msg)) => {
                assert!(msg.contains("must have maximum of 1"))
            }
            other => panic!("Expected ValidationError for maxval, got {:?}", other),
        }
        match cf.getfloat("validation", "zero", None, FloatBounds::positive()) {
            Err(ConfigError::ValidationError(msg)) => assert!(msg.contains("must be above 0")),
            other => panic!("Expected ValidationError for above, got {:?}", other),
        }
        assert!(matches!(
            cf.getfloat("validation", "bad", None, FloatBounds::default()),
            Err(ConfigError::ParseError(..))
        ));
        assert!(matches!(
            cf.getfloat("validation", "nan", None, FloatBounds::default()),
            Err(ConfigError::ParseError(..))
        ));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Configfile::new(None).parse("[]\nkey=val").is_err());
        assert!(Configfile::new(None).parse("[sec]\n=val").is_err());
        assert!(Configfile::new(None).parse("[sec]\njustavalue").is_err());
        assert!(Configfile::new(None).parse("key=val").is_err());
    }
}
