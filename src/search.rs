//! Searches that feed variables during Detect
//!
//! Each search reads one fact about the machine and stores it in its target
//! variable. A search with a `Condition` only runs when the condition holds,
//! so later searches can depend on earlier results. Key and path attributes
//! are formatted with variables before use.

use crate::error::{BurnError, Result};
use crate::package::{parse_guid, required_attr};
use crate::system::{RegistryRoot, SystemProbe};
use crate::variables::{Variables, Variant};
use roxmltree::Node;
use std::path::Path;
use strum::{Display, EnumString};

/// Value written by `MsiProductSearch Result="state"` for an installed product.
pub const MSI_STATE_INSTALLED: i64 = 5;
/// Value written by `MsiProductSearch Result="state"` for an unknown product.
pub const MSI_STATE_UNKNOWN: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum RegistryResult {
    Exists,
    #[default]
    Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum FileResult {
    #[default]
    Exists,
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ProductResult {
    State,
    #[default]
    Version,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchKind {
    Registry {
        root: RegistryRoot,
        key: String,
        value: Option<String>,
        result: RegistryResult,
    },
    File {
        path: String,
        result: FileResult,
    },
    MsiProduct {
        product_code: String,
        result: ProductResult,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Search {
    pub id: String,
    pub variable: String,
    pub condition: Option<String>,
    pub kind: SearchKind,
}

/// Parse a search element; `Ok(None)` for elements that are not searches.
pub fn parse_search(node: Node<'_, '_>) -> Result<Option<Search>> {
    let kind = match node.tag_name().name() {
        "RegistrySearch" => {
            let root = required_attr(node, "Root")?;
            SearchKind::Registry {
                root: root.parse().map_err(|_| {
                    BurnError::parse(format!("RegistrySearch has unknown Root '{}'", root))
                })?,
                key: required_attr(node, "Key")?.to_string(),
                value: node.attribute("Value").map(str::to_string),
                result: parse_result(node)?,
            }
        }
        "FileSearch" => SearchKind::File {
            path: required_attr(node, "Path")?.to_string(),
            result: parse_result(node)?,
        },
        "MsiProductSearch" => {
            let id = node.attribute("Id").unwrap_or("MsiProductSearch");
            SearchKind::MsiProduct {
                product_code: parse_guid(required_attr(node, "ProductCode")?, "ProductCode", id)?,
                result: parse_result(node)?,
            }
        }
        _ => return Ok(None),
    };

    let variable = required_attr(node, "Variable")?.to_string();
    crate::variables::validate_name(&variable)
        .map_err(|_| BurnError::parse(format!("search targets invalid variable '{}'", variable)))?;

    let condition = node.attribute("Condition").map(str::to_string);
    if let Some(condition) = &condition {
        crate::condition::validate(condition)
            .map_err(|e| BurnError::parse(format!("search Condition: {}", e)))?;
    }

    Ok(Some(Search {
        id: node.attribute("Id").unwrap_or(&variable).to_string(),
        variable,
        condition,
        kind,
    }))
}

fn parse_result<T: std::str::FromStr + Default>(node: Node<'_, '_>) -> Result<T> {
    match node.attribute("Result") {
        None => Ok(T::default()),
        Some(raw) => raw.parse().map_err(|_| {
            BurnError::parse(format!(
                "<{}> has unknown Result '{}'",
                node.tag_name().name(),
                raw
            ))
        }),
    }
}

impl Search {
    /// Run the search and store its result. Returns false when the condition
    /// skipped it.
    pub fn execute(&self, probe: &dyn SystemProbe, vars: &mut Variables) -> Result<bool> {
        if let Some(condition) = &self.condition {
            if !crate::condition::evaluate(condition, vars)? {
                tracing::debug!("Search {} skipped: condition '{}' is false", self.id, condition);
                return Ok(false);
            }
        }

        let found = match &self.kind {
            SearchKind::Registry {
                root,
                key,
                value,
                result,
            } => {
                let key = vars.format_string(key);
                let value = value.as_deref().map(|v| vars.format_string(v));
                let read = probe.registry_value(*root, &key, value.as_deref())?;
                match result {
                    RegistryResult::Exists => Some(Variant::Numeric(read.is_some() as i64)),
                    RegistryResult::Value => read,
                }
            }
            SearchKind::File { path, result } => {
                let path = vars.format_string(path);
                let path = Path::new(&path);
                match result {
                    FileResult::Exists => Some(Variant::Numeric(probe.file_exists(path) as i64)),
                    FileResult::Version => probe.file_version(path)?.map(Variant::Version),
                }
            }
            SearchKind::MsiProduct {
                product_code,
                result,
            } => {
                let installed = probe.msi_product_version(product_code)?;
                match result {
                    ProductResult::State => Some(Variant::Numeric(if installed.is_some() {
                        MSI_STATE_INSTALLED
                    } else {
                        MSI_STATE_UNKNOWN
                    })),
                    ProductResult::Version => installed.map(Variant::Version),
                }
            }
        };

        match found {
            Some(value) => {
                tracing::debug!("Search {}: {} = {}", self.id, self.variable, value);
                vars.set(&self.variable, value)?;
            }
            None => tracing::debug!("Search {}: nothing found, {} unchanged", self.id, self.variable),
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(xml: &str) -> Search {
        let doc = roxmltree::Document::parse(xml).unwrap();
        parse_search(doc.root_element()).unwrap().unwrap()
    }

    #[test]
    fn test_parse_registry_search() {
        let search = parse(
            r#"<RegistrySearch Id="S1" Variable="NetFxRelease" Root="HKLM"
                 Key="SOFTWARE\Microsoft\NET Framework Setup\NDP\v4\Full" Value="Release"/>"#,
        );
        assert_eq!(search.variable, "NetFxRelease");
        assert!(matches!(
            search.kind,
            SearchKind::Registry {
                root: RegistryRoot::LocalMachine,
                result: RegistryResult::Value,
                ..
            }
        ));
    }

    #[test]
    fn test_not_a_search() {
        let doc = roxmltree::Document::parse("<Variable Id='A'/>").unwrap();
        assert!(parse_search(doc.root_element()).unwrap().is_none());
    }

    #[test]
    fn test_bad_result_is_parse_error() {
        let doc =
            roxmltree::Document::parse(r#"<FileSearch Variable="F" Path="/x" Result="size"/>"#)
                .unwrap();
        assert!(matches!(
            parse_search(doc.root_element()),
            Err(BurnError::Parse(_))
        ));
    }

    #[test]
    fn test_file_search_formats_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.exe"), b"MZ").unwrap();

        let mut vars = Variables::new();
        vars.set(
            "InstallFolder",
            Variant::String(dir.path().display().to_string()),
        )
        .unwrap();

        let search = parse(r#"<FileSearch Variable="AppPresent" Path="[InstallFolder]/app.exe"/>"#);
        assert!(search.execute(&crate::system::HostSystem, &mut vars).unwrap());
        assert_eq!(vars.get_numeric("AppPresent").unwrap(), 1);
    }

    #[test]
    fn test_condition_skips_search() {
        let mut vars = Variables::new();
        let search = parse(r#"<FileSearch Variable="Found" Path="/nonexistent" Condition="Enabled"/>"#);
        assert!(!search.execute(&crate::system::HostSystem, &mut vars).unwrap());
        assert!(!vars.contains("Found"));
    }
}
