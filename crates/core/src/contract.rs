// Tool contracts
//
// A ToolContract is the {name, version, input schema, output schema} triple a
// tool must satisfy. Contracts are compiled once at registration and are
// immutable afterwards. The manifest (contracts/tools.yaml) is the published
// copy of every contract; `ContractManifest::verify` reports drift between it
// and the registered implementations.

use jsonschema::error::ValidationErrorKind;
use jsonschema::JSONSchema;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use thiserror::Error;

// ============================================================================
// ToolContract
// ============================================================================

/// Published contract of a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolContract {
    pub name: String,
    pub version: Version,
    pub input_schema: Value,
    pub output_schema: Value,
}

impl ToolContract {
    /// `name@version` form used in logs and diagnostics
    pub fn id(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

/// Which half of a contract was checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractPhase {
    Input,
    Output,
}

impl fmt::Display for ContractPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractPhase::Input => f.write_str("input"),
            ContractPhase::Output => f.write_str("output"),
        }
    }
}

/// One schema violation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaViolation {
    /// JSON pointer into the payload; for a missing required field this is
    /// the path of the missing field itself
    pub path: String,
    /// JSON pointer into the schema keyword that failed
    pub schema_path: String,
    pub message: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        write!(f, "{path}: {}", self.message)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ContractError {
    #[error("Invalid {phase} schema for {tool}: {message}")]
    InvalidSchema {
        tool: String,
        phase: ContractPhase,
        message: String,
    },

    #[error("Tool {0} is registered twice")]
    Duplicate(String),
}

// ============================================================================
// CompiledContract
// ============================================================================

/// A contract with its schemas compiled for validation
pub struct CompiledContract {
    contract: ToolContract,
    input: JSONSchema,
    output: JSONSchema,
}

impl fmt::Debug for CompiledContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledContract")
            .field("contract", &self.contract.id())
            .finish()
    }
}

impl CompiledContract {
    pub fn compile(contract: ToolContract) -> Result<Self, ContractError> {
        let input = compile_schema(&contract, ContractPhase::Input)?;
        let output = compile_schema(&contract, ContractPhase::Output)?;
        Ok(Self {
            contract,
            input,
            output,
        })
    }

    pub fn contract(&self) -> &ToolContract {
        &self.contract
    }

    pub fn version(&self) -> &Version {
        &self.contract.version
    }

    pub fn validate_input(&self, payload: &Value) -> Result<(), Vec<SchemaViolation>> {
        validate(&self.input, payload)
    }

    pub fn validate_output(&self, payload: &Value) -> Result<(), Vec<SchemaViolation>> {
        validate(&self.output, payload)
    }
}

fn compile_schema(
    contract: &ToolContract,
    phase: ContractPhase,
) -> Result<JSONSchema, ContractError> {
    let schema = match phase {
        ContractPhase::Input => &contract.input_schema,
        ContractPhase::Output => &contract.output_schema,
    };
    JSONSchema::compile(schema).map_err(|e| ContractError::InvalidSchema {
        tool: contract.id(),
        phase,
        message: e.to_string(),
    })
}

fn validate(schema: &JSONSchema, payload: &Value) -> Result<(), Vec<SchemaViolation>> {
    let Err(errors) = schema.validate(payload) else {
        return Ok(());
    };
    let violations = errors
        .map(|error| {
            let instance_path = error.instance_path.to_string();
            let path = match &error.kind {
                ValidationErrorKind::Required { property } => {
                    let field = property
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| property.to_string());
                    format!("{instance_path}/{field}")
                }
                _ => instance_path,
            };
            SchemaViolation {
                path,
                schema_path: error.schema_path.to_string(),
                message: error.to_string(),
            }
        })
        .collect();
    Err(violations)
}

/// Compact, bounded rendering of a payload for diagnostics
pub fn summarize_payload(payload: &Value) -> String {
    const MAX_LEN: usize = 200;
    let rendered = payload.to_string();
    if rendered.len() <= MAX_LEN {
        return rendered;
    }
    let mut end = MAX_LEN;
    while !rendered.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &rendered[..end])
}

// ============================================================================
// Manifest
// ============================================================================

/// Difference between the manifest and the registered tools
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractMismatch {
    /// Declared in the manifest but no tool implements it
    MissingImplementation { contract: String },
    /// Registered tool with no manifest entry
    Undeclared { contract: String },
    /// Both exist but a schema differs
    SchemaMismatch {
        contract: String,
        phase: ContractPhase,
    },
}

impl fmt::Display for ContractMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractMismatch::MissingImplementation { contract } => {
                write!(f, "{contract} is declared in the manifest but not implemented")
            }
            ContractMismatch::Undeclared { contract } => {
                write!(f, "{contract} is implemented but missing from the manifest")
            }
            ContractMismatch::SchemaMismatch { contract, phase } => {
                write!(f, "{contract} {phase} schema differs from the manifest")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Declarative set of published tool contracts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContractManifest {
    pub contracts: Vec<ToolContract>,
}

impl ContractManifest {
    pub fn from_yaml_str(contents: &str) -> Result<Self, ManifestError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&contents)
    }

    /// Build a manifest from registered contracts (used to regenerate the file)
    pub fn from_contracts(mut contracts: Vec<ToolContract>) -> Self {
        contracts.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));
        Self { contracts }
    }

    pub fn to_yaml(&self) -> Result<String, ManifestError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Compare against the implemented contracts; empty means in sync
    pub fn verify(&self, implemented: &[ToolContract]) -> Vec<ContractMismatch> {
        let mut mismatches = Vec::new();

        for declared in &self.contracts {
            match implemented
                .iter()
                .find(|c| c.name == declared.name && c.version == declared.version)
            {
                None => mismatches.push(ContractMismatch::MissingImplementation {
                    contract: declared.id(),
                }),
                Some(actual) => {
                    if actual.input_schema != declared.input_schema {
                        mismatches.push(ContractMismatch::SchemaMismatch {
                            contract: declared.id(),
                            phase: ContractPhase::Input,
                        });
                    }
                    if actual.output_schema != declared.output_schema {
                        mismatches.push(ContractMismatch::SchemaMismatch {
                            contract: declared.id(),
                            phase: ContractPhase::Output,
                        });
                    }
                }
            }
        }

        for actual in implemented {
            let declared = self
                .contracts
                .iter()
                .any(|c| c.name == actual.name && c.version == actual.version);
            if !declared {
                mismatches.push(ContractMismatch::Undeclared {
                    contract: actual.id(),
                });
            }
        }

        mismatches
    }
}
