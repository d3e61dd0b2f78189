//! Typed variable store
//!
//! Variables are named numeric, string or version values. The store owns every
//! value; callers only ever receive copies. Hidden variables (passwords, keys)
//! format normally into installer command lines but are masked in logs and are
//! never written to the resume state blob.

use crate::error::{BurnError, Result};
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Built-in variable names maintained by the engine.
pub mod builtin {
    pub const BUNDLE_NAME: &str = "WixBundleName";
    pub const BUNDLE_VERSION: &str = "WixBundleVersion";
    pub const BUNDLE_ACTION: &str = "WixBundleAction";
    pub const BUNDLE_INSTALLED: &str = "WixBundleInstalled";
    pub const PRIVILEGED: &str = "Privileged";
    pub const REBOOT_PENDING: &str = "RebootPending";

    pub const ALL: &[&str] = &[
        BUNDLE_NAME,
        BUNDLE_VERSION,
        BUNDLE_ACTION,
        BUNDLE_INSTALLED,
        PRIVILEGED,
        REBOOT_PENDING,
    ];
}

const HIDDEN_MASK: &str = "*****";

/// A variable value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Variant {
    Numeric(i64),
    String(String),
    Version(Version),
}

impl Variant {
    /// Numeric view of the value (strings are parsed, versions are packed).
    pub fn as_numeric(&self) -> Result<i64> {
        match self {
            Self::Numeric(n) => Ok(*n),
            Self::String(s) => s
                .trim()
                .parse()
                .map_err(|_| BurnError::variable(format!("'{}' is not a number", s))),
            Self::Version(v) => i64::try_from(v.packed())
                .map_err(|_| BurnError::variable(format!("version {} does not fit a number", v))),
        }
    }

    /// Version view of the value.
    pub fn as_version(&self) -> Result<Version> {
        match self {
            Self::Version(v) => Ok(*v),
            Self::Numeric(n) => u64::try_from(*n)
                .map(Version::from_packed)
                .map_err(|_| BurnError::variable(format!("{} is not a valid version", n))),
            Self::String(s) => s
                .parse::<Version>()
                .map_err(|e| BurnError::variable(format!("'{}': {}", s, e))),
        }
    }

    /// Truthiness used by bare variable references in conditions.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Numeric(n) => *n != 0,
            Self::String(s) => !s.is_empty(),
            Self::Version(v) => v.packed() != 0,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Numeric(_) => "numeric",
            Self::String(_) => "string",
            Self::Version(_) => "version",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(n) => write!(f, "{}", n),
            Self::String(s) => f.write_str(s),
            Self::Version(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone)]
struct Variable {
    value: Variant,
    hidden: bool,
    builtin: bool,
}

/// The engine's variable store, ordered by name.
#[derive(Debug, Clone, Default)]
pub struct Variables {
    vars: BTreeMap<String, Variable>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a variable from the manifest.
    pub fn declare(&mut self, name: &str, value: Option<Variant>, hidden: bool) -> Result<()> {
        validate_name(name)?;
        if builtin::ALL.contains(&name) {
            return Err(BurnError::variable(format!(
                "'{}' is a built-in variable and cannot be declared",
                name
            )));
        }
        match value {
            Some(value) => {
                self.vars.insert(
                    name.to_string(),
                    Variable {
                        value,
                        hidden,
                        builtin: false,
                    },
                );
            }
            None if hidden => {
                // Remember the hidden flag so a later set keeps it.
                self.vars.insert(
                    name.to_string(),
                    Variable {
                        value: Variant::String(String::new()),
                        hidden,
                        builtin: false,
                    },
                );
            }
            None => {}
        }
        Ok(())
    }

    /// Set or replace a built-in variable. Engine use only.
    pub fn set_builtin(&mut self, name: &'static str, value: Variant) {
        debug_assert!(builtin::ALL.contains(&name));
        self.vars.insert(
            name.to_string(),
            Variable {
                value,
                hidden: false,
                builtin: true,
            },
        );
    }

    /// Set a user variable; built-ins are read-only.
    pub fn set(&mut self, name: &str, value: Variant) -> Result<()> {
        validate_name(name)?;
        match self.vars.get_mut(name) {
            Some(var) if var.builtin => Err(BurnError::variable(format!(
                "built-in variable '{}' is read-only",
                name
            ))),
            Some(var) => {
                var.value = value;
                Ok(())
            }
            None => {
                self.vars.insert(
                    name.to_string(),
                    Variable {
                        value,
                        hidden: false,
                        builtin: false,
                    },
                );
                Ok(())
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Result<()> {
        match self.vars.get(name) {
            Some(var) if var.builtin => Err(BurnError::variable(format!(
                "built-in variable '{}' is read-only",
                name
            ))),
            _ => {
                self.vars.remove(name);
                Ok(())
            }
        }
    }

    /// A copy of the value, if set.
    pub fn get(&self, name: &str) -> Option<Variant> {
        self.vars.get(name).map(|v| v.value.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn is_hidden(&self, name: &str) -> bool {
        self.vars.get(name).is_some_and(|v| v.hidden)
    }

    pub fn get_numeric(&self, name: &str) -> Result<i64> {
        self.require(name)?.as_numeric()
    }

    pub fn get_string(&self, name: &str) -> Result<String> {
        Ok(self.require(name)?.to_string())
    }

    pub fn get_version(&self, name: &str) -> Result<Version> {
        self.require(name)?.as_version()
    }

    fn require(&self, name: &str) -> Result<&Variant> {
        self.vars
            .get(name)
            .map(|v| &v.value)
            .ok_or_else(|| BurnError::variable(format!("variable '{}' is not set", name)))
    }

    /// Value as it may appear in a log line.
    pub fn display_value(&self, name: &str) -> String {
        match self.vars.get(name) {
            Some(v) if v.hidden => HIDDEN_MASK.to_string(),
            Some(v) => v.value.to_string(),
            None => String::new(),
        }
    }

    /// Substitute `[Name]` references with variable values.
    pub fn format_string(&self, template: &str) -> String {
        let mut source = self;
        format_pair(&mut source, template)
            .map(|(formatted, _)| formatted)
            .unwrap_or_else(|_| template.to_string())
    }

    /// Like `format_string`, with hidden values masked. Use for logging.
    pub fn format_string_obfuscated(&self, template: &str) -> String {
        let mut source = self;
        format_pair(&mut source, template)
            .map(|(_, display)| display)
            .unwrap_or_else(|_| template.to_string())
    }

    /// Variables written into the resume state: user variables that are not hidden.
    pub fn persistable(&self) -> BTreeMap<String, Variant> {
        self.vars
            .iter()
            .filter(|(_, v)| !v.builtin && !v.hidden)
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }

    /// Restore persisted variables, keeping built-ins untouched.
    pub fn restore(&mut self, persisted: &BTreeMap<String, Variant>) -> Result<()> {
        for (name, value) in persisted {
            if builtin::ALL.contains(&name.as_str()) {
                continue;
            }
            self.set(name, value.clone())?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Variable names: letters, digits, `_` and `.`, not starting with a digit.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(BurnError::variable(format!("invalid variable name '{}'", name)))
    }
}

/// A resolved variable reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    pub value: String,
    pub hidden: bool,
}

/// Anything `[Name]` references can be resolved against.
///
/// The engine resolves against its own store; the elevated companion resolves
/// by asking the originating process over the pipe.
pub trait VariableSource {
    fn lookup(&mut self, name: &str) -> Result<Option<Lookup>>;
}

impl VariableSource for &Variables {
    fn lookup(&mut self, name: &str) -> Result<Option<Lookup>> {
        Ok(self.vars.get(name).map(|v| Lookup {
            value: v.value.to_string(),
            hidden: v.hidden,
        }))
    }
}

/// Format `template`, returning the real string and a log-safe copy.
pub fn format_pair(source: &mut dyn VariableSource, template: &str) -> Result<(String, String)> {
    let mut out = String::with_capacity(template.len());
    let mut display = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('[') {
        out.push_str(&rest[..open]);
        display.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        // `[\x]` is a literal x (used for brackets)
        if let Some(escaped) = after.strip_prefix('\\') {
            let mut chars = escaped.chars();
            if let (Some(c), Some(']')) = (chars.next(), chars.next()) {
                out.push(c);
                display.push(c);
                rest = chars.as_str();
                continue;
            }
        }

        match after.find(']') {
            Some(close) if validate_name(&after[..close]).is_ok() => {
                if let Some(found) = source.lookup(&after[..close])? {
                    out.push_str(&found.value);
                    display.push_str(if found.hidden { HIDDEN_MASK } else { &found.value });
                }
                rest = &after[close + 1..];
            }
            _ => {
                out.push('[');
                display.push('[');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    display.push_str(rest);
    Ok((out, display))
}
