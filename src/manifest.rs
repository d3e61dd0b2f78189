//! Bundle manifest
//!
//! The manifest is the document embedded in a bundle that describes it:
//!
//! ```xml
//! <BurnManifest>
//!   <Registration Id="{GUID}" Name="Contoso Suite" Version="1.2.0.0"
//!                 Publisher="Contoso" PerMachine="yes"/>
//!   <Variable Id="InstallFolder" Value="/opt/contoso" Type="string"/>
//!   <FileSearch Id="S1" Variable="ToolPresent" Path="[InstallFolder]/tool"/>
//!   <Chain>
//!     <MsiPackage Id="Core" FileName="core.msi" ProductCode="{GUID}" ProductVersion="1.2.0.0"/>
//!     <ExePackage Id="Tool" FileName="tool.exe" DetectCondition="ToolPresent"
//!                 InstallArguments="/install" UninstallArguments="/uninstall"/>
//!   </Chain>
//! </BurnManifest>
//! ```
//!
//! Any malformed element fails the whole load.

use crate::error::{BurnError, Result};
use crate::package::{Package, parse_guid, parse_package, required_attr, yes_no};
use crate::search::{Search, parse_search};
use crate::variables::{Variables, Variant, builtin};
use crate::version::Version;
use roxmltree::{Document, Node};
use std::collections::HashSet;
use std::path::Path;

/// Bundle identity and the data shown in the programs list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Bundle code, normalized `{GUID}`
    pub id: String,
    pub name: String,
    pub version: Version,
    pub publisher: Option<String>,
    pub per_machine: bool,
}

/// A manifest `<Variable>` declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableDecl {
    pub id: String,
    pub value: Option<Variant>,
    pub hidden: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub registration: Registration,
    pub variables: Vec<VariableDecl>,
    pub searches: Vec<Search>,
    /// Chain order
    pub packages: Vec<Package>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let xml = std::fs::read_to_string(path).map_err(|e| {
            BurnError::parse(format!("cannot read manifest {}: {}", path.display(), e))
        })?;
        Self::parse(&xml)
    }

    pub fn parse(xml: &str) -> Result<Self> {
        let doc = Document::parse(xml).map_err(|e| BurnError::parse(e.to_string()))?;
        let root = doc.root_element();
        if !root.has_tag_name("BurnManifest") {
            return Err(BurnError::parse(format!(
                "expected <BurnManifest>, found <{}>",
                root.tag_name().name()
            )));
        }

        let mut registration = None;
        let mut variables = Vec::new();
        let mut searches = Vec::new();
        let mut packages = Vec::new();

        for node in root.children().filter(Node::is_element) {
            match node.tag_name().name() {
                "Registration" => {
                    if registration.is_some() {
                        return Err(BurnError::parse("duplicate <Registration>"));
                    }
                    registration = Some(parse_registration(node)?);
                }
                "Variable" => variables.push(parse_variable(node)?),
                "Chain" => {
                    for child in node.children().filter(Node::is_element) {
                        packages.push(parse_package(child)?);
                    }
                }
                _ => match parse_search(node)? {
                    Some(search) => searches.push(search),
                    None => tracing::debug!(
                        "Ignoring manifest element <{}>",
                        node.tag_name().name()
                    ),
                },
            }
        }

        let registration =
            registration.ok_or_else(|| BurnError::parse("missing <Registration>"))?;

        let mut seen = HashSet::new();
        for package in &packages {
            if !seen.insert(package.id.as_str()) {
                return Err(BurnError::parse(format!("duplicate package Id '{}'", package.id)));
            }
        }
        let mut seen = HashSet::new();
        for var in &variables {
            if !seen.insert(var.id.as_str()) {
                return Err(BurnError::parse(format!("duplicate variable '{}'", var.id)));
            }
        }

        tracing::debug!(
            "Manifest {} v{}: {} variable(s), {} search(es), {} package(s)",
            registration.name,
            registration.version,
            variables.len(),
            searches.len(),
            packages.len()
        );

        Ok(Self {
            registration,
            variables,
            searches,
            packages,
        })
    }

    pub fn package(&self, id: &str) -> Option<&Package> {
        self.packages.iter().find(|p| p.id == id)
    }

    /// Variable store as it is before any detection: manifest declarations
    /// plus the bundle identity built-ins.
    pub fn initial_variables(&self) -> Result<Variables> {
        let mut vars = Variables::new();
        for decl in &self.variables {
            vars.declare(&decl.id, decl.value.clone(), decl.hidden)?;
        }
        vars.set_builtin(
            builtin::BUNDLE_NAME,
            Variant::String(self.registration.name.clone()),
        );
        vars.set_builtin(
            builtin::BUNDLE_VERSION,
            Variant::Version(self.registration.version),
        );
        Ok(vars)
    }

    /// Whether any package in the chain installs per-machine.
    pub fn has_per_machine_packages(&self) -> bool {
        self.packages.iter().any(|p| p.per_machine)
    }
}

fn parse_registration(node: Node<'_, '_>) -> Result<Registration> {
    let id = parse_guid(required_attr(node, "Id")?, "Id", "bundle")?;
    let raw_version = required_attr(node, "Version")?;
    let version: Version = raw_version
        .parse()
        .map_err(|e| BurnError::parse(format!("bundle has invalid Version '{}': {}", raw_version, e)))?;

    Ok(Registration {
        id,
        name: required_attr(node, "Name")?.to_string(),
        version,
        publisher: node.attribute("Publisher").map(str::to_string),
        per_machine: yes_no(node, "PerMachine", false)?,
    })
}

fn parse_variable(node: Node<'_, '_>) -> Result<VariableDecl> {
    let id = required_attr(node, "Id")?.to_string();
    crate::variables::validate_name(&id)
        .map_err(|_| BurnError::parse(format!("invalid variable Id '{}'", id)))?;
    if builtin::ALL.contains(&id.as_str()) {
        return Err(BurnError::parse(format!("variable '{}' is built in", id)));
    }

    let value = match (node.attribute("Value"), node.attribute("Type").unwrap_or("string")) {
        (None, _) => None,
        (Some(raw), "string") => Some(Variant::String(raw.to_string())),
        (Some(raw), "numeric") => Some(Variant::Numeric(raw.trim().parse().map_err(|_| {
            BurnError::parse(format!("variable '{}' has non-numeric value '{}'", id, raw))
        })?)),
        (Some(raw), "version") => Some(Variant::Version(raw.parse::<Version>().map_err(|e| {
            BurnError::parse(format!("variable '{}' has invalid version '{}': {}", id, raw, e))
        })?)),
        (Some(_), other) => {
            return Err(BurnError::parse(format!(
                "variable '{}' has unknown Type '{}'",
                id, other
            )));
        }
    };

    Ok(VariableDecl {
        hidden: yes_no(node, "Hidden", false)?,
        id,
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PackageType;

    const SAMPLE: &str = r#"
        <BurnManifest>
          <Registration Id="{2C5B0B3A-8A4C-4E28-9D4B-55B0C1D2E3F4}" Name="Contoso Suite"
                        Version="1.2.0.0" Publisher="Contoso" PerMachine="yes"/>
          <Variable Id="InstallFolder" Value="/opt/contoso" Type="string"/>
          <Variable Id="Port" Value="8080" Type="numeric"/>
          <Variable Id="DbPassword" Hidden="yes"/>
          <FileSearch Id="S1" Variable="ToolPresent" Path="[InstallFolder]/tool"/>
          <Chain>
            <MsiPackage Id="Core" FileName="core.msi" PerMachine="yes"
                        ProductCode="{6F330B47-2577-43AD-9095-1861BA25889B}" ProductVersion="1.2.0.0">
              <MsiProperty Id="INSTALLDIR" Value="[InstallFolder]"/>
            </MsiPackage>
            <ExePackage Id="Tool" FileName="tool.exe" Vital="no" DetectCondition="ToolPresent"
                        InstallArguments="/install" UninstallArguments="/uninstall"/>
            <MsuPackage Id="Hotfix" FileName="kb.msu" KB="KB2999226" Permanent="yes"/>
          </Chain>
        </BurnManifest>"#;

    #[test]
    fn test_parse_sample() {
        let manifest = Manifest::parse(SAMPLE).unwrap();
        assert_eq!(manifest.registration.name, "Contoso Suite");
        assert!(manifest.registration.per_machine);
        assert_eq!(manifest.variables.len(), 3);
        assert_eq!(manifest.searches.len(), 1);

        let types: Vec<_> = manifest.packages.iter().map(|p| p.package_type()).collect();
        assert_eq!(types, vec![PackageType::Msi, PackageType::Exe, PackageType::Msu]);
        assert!(!manifest.package("Tool").unwrap().vital);
        assert!(manifest.package("Hotfix").unwrap().permanent);
        assert!(manifest.has_per_machine_packages());
    }

    #[test]
    fn test_initial_variables() {
        let vars = Manifest::parse(SAMPLE).unwrap().initial_variables().unwrap();
        assert_eq!(vars.get_numeric("Port").unwrap(), 8080);
        assert_eq!(vars.get_string(builtin::BUNDLE_NAME).unwrap(), "Contoso Suite");
        assert!(vars.is_hidden("DbPassword"));
    }

    #[test]
    fn test_missing_product_code_is_fatal() {
        let xml = SAMPLE.replace(r#"ProductCode="{6F330B47-2577-43AD-9095-1861BA25889B}""#, "");
        let err = Manifest::parse(&xml).unwrap_err();
        assert!(err.is_fatal_to_load());
    }

    #[test]
    fn test_bad_guid_and_version_are_fatal() {
        let xml = SAMPLE.replace("{6F330B47-2577-43AD-9095-1861BA25889B}", "{6F330B47}");
        assert!(Manifest::parse(&xml).is_err());

        let xml = SAMPLE.replace(r#"ProductVersion="1.2.0.0""#, r#"ProductVersion="1.x""#);
        assert!(Manifest::parse(&xml).is_err());
    }

    #[test]
    fn test_msu_needs_kb_or_condition() {
        let xml = SAMPLE.replace(r#"KB="KB2999226""#, "");
        assert!(matches!(Manifest::parse(&xml), Err(BurnError::Parse(_))));
    }

    #[test]
    fn test_duplicate_package_id() {
        let xml = SAMPLE.replace(r#"Id="Hotfix""#, r#"Id="Tool""#);
        assert!(Manifest::parse(&xml).is_err());
    }

    #[test]
    fn test_missing_registration() {
        assert!(Manifest::parse("<BurnManifest><Chain/></BurnManifest>").is_err());
        assert!(Manifest::parse("<Bundle/>").is_err());
    }
}
