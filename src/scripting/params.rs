//! Scripting request parameters.
//!
//! `ScriptingParams` is the validated parameter bundle submitted with a
//! `scripting/script` request. Scripting options form a closed registry:
//! every option is either a boolean or restricted to a fixed set of values,
//! and unknown option names are rejected instead of being passed through.

use std::fmt;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Replacement for the connection string in anything that gets logged.
pub const REDACTED: &str = "*********";

/// Default value of `ScriptDestination`.
pub const DEFAULT_SCRIPT_DESTINATION: &str = "ToSingleFile";

/// Rejected scripting option override.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidOptionError {
    /// The option name is not part of the registry.
    #[error("Unknown scripting option: {0}")]
    UnknownOption(String),

    /// An enumerated option was given a value outside its allowed set.
    #[error("Option: {option} has invalid value: {value}")]
    InvalidValue {
        /// Option name.
        option: String,
        /// Rejected value.
        value: Value,
    },

    /// A boolean option was given a non-boolean value.
    #[error("Option: {option} has unexpected value type: {value}")]
    NotBoolean {
        /// Option name.
        option: String,
        /// Rejected value.
        value: Value,
    },
}

/// Errors building [`ScriptingParams`] from a loosely-typed parameter map.
#[derive(Debug, Error)]
pub enum ParameterError {
    /// A required key is absent.
    #[error("Missing required parameter: {0}")]
    Missing(&'static str),

    /// A key is present with the wrong JSON type.
    #[error("Parameter {key} must be {expected}")]
    WrongType {
        /// Parameter name.
        key: String,
        /// Human-readable expected type.
        expected: &'static str,
    },

    /// A scripting option failed validation.
    #[error(transparent)]
    InvalidOption(#[from] InvalidOptionError),
}

/// Value domain of one scripting option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    /// `true` / `false`.
    Boolean,
    /// One of a fixed set of string values.
    Choice(&'static [&'static str]),
}

/// Registry entry for one scripting option.
#[derive(Debug, Clone, Copy)]
pub struct OptionSpec {
    /// Wire name.
    pub name: &'static str,
    /// Value domain.
    pub kind: OptionKind,
    /// Value used when no override is given.
    pub default: OptionValue,
}

/// Current value of one scripting option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionValue {
    Flag(bool),
    Choice(&'static str),
}

impl Serialize for OptionValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            OptionValue::Flag(flag) => serializer.serialize_bool(*flag),
            OptionValue::Choice(choice) => serializer.serialize_str(choice),
        }
    }
}

const TYPE_OF_DATA: &[&str] = &["SchemaAndData", "DataOnly", "SchemaOnly"];
const CREATE_DROP: &[&str] = &["ScriptCreate", "ScriptDrop", "ScriptCreateDrop"];
const ENGINE_TYPES: &[&str] = &["SingleInstance", "SqlAzure"];
const STATISTICS: &[&str] = &["ScriptStatsAll", "ScriptStatsNone", "ScriptStatsDll"];
const COMPATIBILITY: &[&str] = &[
    "Script90Compat",
    "Script100Compat",
    "Script105Compat",
    "Script110Compat",
    "Script120Compat",
    "Script130Compat",
    "Script140Compat",
];
const ENGINE_EDITIONS: &[&str] = &[
    "SqlServerStandardEdition",
    "SqlServerPersonalEdition",
    "SqlServerExpressEdition",
    "SqlServerEnterpriseEdition",
    "SqlServerStretchDatabaseEdition",
    "SqlAzureDatabaseEdition",
    "SqlDatawarehouseEdition",
];

const fn flag(name: &'static str) -> OptionSpec {
    OptionSpec {
        name,
        kind: OptionKind::Boolean,
        default: OptionValue::Flag(false),
    }
}

const fn choice(
    name: &'static str,
    allowed: &'static [&'static str],
    default: &'static str,
) -> OptionSpec {
    OptionSpec {
        name,
        kind: OptionKind::Choice(allowed),
        default: OptionValue::Choice(default),
    }
}

/// Every recognized scripting option, in wire order.
pub const SCRIPTING_OPTIONS: &[OptionSpec] = &[
    // General
    flag("ScriptAnsiPadding"),
    flag("AppendToFile"),
    flag("IncludeIfNotExists"),
    flag("ContinueScriptingOnError"),
    flag("ConvertUDDTToBaseType"),
    flag("GenerateScriptForDependentObjects"),
    flag("IncludeDescriptiveHeaders"),
    flag("IncludeSystemConstraintNames"),
    flag("IncludeUnsupportedStatements"),
    flag("SchemaQualify"),
    flag("Bindings"),
    flag("Collation"),
    flag("Default"),
    flag("ScriptExtendedProperties"),
    flag("ScriptLogins"),
    flag("ScriptObjectLevelPermissions"),
    flag("ScriptOwner"),
    flag("ScriptUseDatabase"),
    // Table/View
    flag("ScriptChangeTracking"),
    flag("ScriptCheckConstraints"),
    flag("ScriptDataCompressionOptions"),
    flag("ScriptForeignKeys"),
    flag("ScriptFullTextIndexes"),
    flag("ScriptIndexes"),
    flag("ScriptPrimaryKeys"),
    flag("ScriptTriggers"),
    flag("UniqueKeys"),
    // Enumerated
    choice("TypeOfDataToScript", TYPE_OF_DATA, "SchemaOnly"),
    choice("ScriptCreateDrop", CREATE_DROP, "ScriptCreate"),
    choice("TargetDatabaseEngineType", ENGINE_TYPES, "SingleInstance"),
    choice("ScriptStatistics", STATISTICS, "ScriptStatsNone"),
    choice("ScriptCompatibilityOption", COMPATIBILITY, "Script140Compat"),
    choice("TargetDatabaseEngineEdition", ENGINE_EDITIONS, "SqlServerStandardEdition"),
];

fn option_index(name: &str) -> Option<usize> {
    SCRIPTING_OPTIONS.iter().position(|spec| spec.name == name)
}

/// Validate one override against the registry.
fn validate(name: &str, value: &Value) -> Result<(usize, OptionValue), InvalidOptionError> {
    let index =
        option_index(name).ok_or_else(|| InvalidOptionError::UnknownOption(name.to_string()))?;

    let validated = match SCRIPTING_OPTIONS[index].kind {
        OptionKind::Boolean => match value {
            Value::Bool(flag) => OptionValue::Flag(*flag),
            _ => {
                return Err(InvalidOptionError::NotBoolean {
                    option: name.to_string(),
                    value: value.clone(),
                })
            }
        },
        OptionKind::Choice(allowed) => {
            match value.as_str().and_then(|v| allowed.iter().find(|a| **a == v).copied()) {
                Some(member) => OptionValue::Choice(member),
                None => {
                    return Err(InvalidOptionError::InvalidValue {
                        option: name.to_string(),
                        value: value.clone(),
                    })
                }
            }
        }
    };

    Ok((index, validated))
}

/// Advanced scripting options, one value per registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptingOptions {
    values: Vec<OptionValue>,
}

impl Default for ScriptingOptions {
    fn default() -> Self {
        Self {
            values: SCRIPTING_OPTIONS.iter().map(|spec| spec.default).collect(),
        }
    }
}

impl ScriptingOptions {
    /// Defaults with `overrides` applied.
    pub fn with_overrides(overrides: &Map<String, Value>) -> Result<Self, InvalidOptionError> {
        let mut options = Self::default();
        options.update_options(overrides)?;
        Ok(options)
    }

    /// Apply overrides.
    ///
    /// Every override is validated before any is applied, so a rejected call
    /// leaves the options unchanged.
    pub fn update_options(&mut self, overrides: &Map<String, Value>) -> Result<(), InvalidOptionError> {
        let validated = overrides
            .iter()
            .map(|(name, value)| validate(name, value))
            .collect::<Result<Vec<_>, _>>()?;

        for (index, value) in validated {
            self.values[index] = value;
        }
        Ok(())
    }

    /// Current value of a named option.
    pub fn get(&self, name: &str) -> Option<OptionValue> {
        option_index(name).map(|index| self.values[index])
    }

    /// `(name, value)` pairs in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, OptionValue)> + '_ {
        SCRIPTING_OPTIONS
            .iter()
            .zip(&self.values)
            .map(|(spec, value)| (spec.name, *value))
    }
}

impl Serialize for ScriptingOptions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, &value)?;
        }
        map.end()
    }
}

/// A database object selected by optional type, optional schema, and name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ObjectCriterion {
    #[serde(rename = "Type")]
    pub object_type: Option<String>,
    pub schema: Option<String>,
    pub name: String,
}

impl ObjectCriterion {
    /// Parse a `schema.name` token.
    ///
    /// The token is split at the first `.`. Without a separator (or with a
    /// leading one) the whole token is the name and the schema is absent.
    /// Parsing never fails.
    pub fn parse(token: &str) -> Self {
        match token.find('.') {
            Some(index) if index > 0 => Self {
                object_type: None,
                schema: Some(token[..index].to_string()),
                name: token[index + 1..].to_string(),
            },
            _ => Self {
                object_type: None,
                schema: None,
                name: token.to_string(),
            },
        }
    }
}

impl From<&str> for ObjectCriterion {
    fn from(token: &str) -> Self {
        Self::parse(token)
    }
}

fn parse_criteria<I, S>(tokens: I) -> Vec<ObjectCriterion>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tokens
        .into_iter()
        .map(|token| ObjectCriterion::parse(token.as_ref()))
        .collect()
}

fn to_strings<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

/// Validated parameter bundle for one `scripting/script` request.
///
/// Immutable once built. `Debug` never prints the connection string.
#[derive(Clone, PartialEq)]
pub struct ScriptingParams {
    file_path: String,
    connection_string: String,
    script_destination: String,
    include_objects: Vec<ObjectCriterion>,
    exclude_objects: Vec<ObjectCriterion>,
    include_schemas: Option<Vec<String>>,
    exclude_schemas: Option<Vec<String>>,
    include_types: Option<Vec<String>>,
    exclude_types: Option<Vec<String>>,
    options: ScriptingOptions,
}

impl ScriptingParams {
    /// Start building parameters for a script written to `file_path`.
    pub fn builder(
        file_path: impl Into<String>,
        connection_string: impl Into<String>,
    ) -> ScriptingParamsBuilder {
        ScriptingParamsBuilder {
            params: ScriptingParams {
                file_path: file_path.into(),
                connection_string: connection_string.into(),
                script_destination: DEFAULT_SCRIPT_DESTINATION.to_string(),
                include_objects: Vec::new(),
                exclude_objects: Vec::new(),
                include_schemas: None,
                exclude_schemas: None,
                include_types: None,
                exclude_types: None,
                options: ScriptingOptions::default(),
            },
            overrides: Map::new(),
        }
    }

    /// Build from a parameter map.
    ///
    /// Recognized keys: `FilePath` and `ConnectionString` (required),
    /// `ScriptDestination`, `IncludeObjects`, `ExcludeObjects`,
    /// `IncludeSchemas`, `ExcludeSchemas`, `IncludeTypes`, `ExcludeTypes`.
    /// A `null` value for one of these is treated as absent. Every other key
    /// is a scripting option override, where `null` is an invalid value.
    pub fn from_parameters(parameters: &Map<String, Value>) -> Result<Self, ParameterError> {
        let file_path = required_str(parameters, "FilePath")?;
        let connection_string = required_str(parameters, "ConnectionString")?;
        let mut builder = Self::builder(file_path, connection_string);
        let mut overrides = Map::new();

        for (key, value) in parameters {
            match key.as_str() {
                "FilePath" | "ConnectionString" => {}
                "ScriptDestination" | "IncludeObjects" | "ExcludeObjects" | "IncludeSchemas"
                | "ExcludeSchemas" | "IncludeTypes" | "ExcludeTypes"
                    if value.is_null() => {}
                "ScriptDestination" => {
                    let destination = value.as_str().ok_or_else(|| ParameterError::WrongType {
                        key: key.clone(),
                        expected: "a string",
                    })?;
                    builder = builder.script_destination(destination);
                }
                "IncludeObjects" => builder = builder.include_objects(string_list(key, value)?),
                "ExcludeObjects" => builder = builder.exclude_objects(string_list(key, value)?),
                "IncludeSchemas" => builder = builder.include_schemas(string_list(key, value)?),
                "ExcludeSchemas" => builder = builder.exclude_schemas(string_list(key, value)?),
                "IncludeTypes" => builder = builder.include_types(string_list(key, value)?),
                "ExcludeTypes" => builder = builder.exclude_types(string_list(key, value)?),
                _ => {
                    overrides.insert(key.clone(), value.clone());
                }
            }
        }

        Ok(builder.options(overrides).build()?)
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn script_destination(&self) -> &str {
        &self.script_destination
    }

    pub fn include_objects(&self) -> &[ObjectCriterion] {
        &self.include_objects
    }

    pub fn exclude_objects(&self) -> &[ObjectCriterion] {
        &self.exclude_objects
    }

    pub fn options(&self) -> &ScriptingOptions {
        &self.options
    }

    /// Wire dictionary consumed by `scripting/script`.
    ///
    /// A pure projection: all defaults were resolved at build time.
    pub fn format(&self) -> Value {
        self.project(&self.connection_string)
    }

    /// [`format`](Self::format) with the connection string masked, for logging.
    pub fn redacted(&self) -> Value {
        self.project(REDACTED)
    }

    fn project(&self, connection_string: &str) -> Value {
        json!({
            "FilePath": self.file_path,
            "ConnectionString": connection_string,
            "IncludeObjectCriteria": self.include_objects,
            "ExcludeObjectCriteria": self.exclude_objects,
            "IncludeSchemas": self.include_schemas,
            "ExcludeSchemas": self.exclude_schemas,
            "IncludeTypes": self.include_types,
            "ExcludeTypes": self.exclude_types,
            "ScriptOptions": self.options,
            "ScriptDestination": self.script_destination,
        })
    }
}

impl fmt::Debug for ScriptingParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptingParams")
            .field("file_path", &self.file_path)
            .field("connection_string", &REDACTED)
            .field("script_destination", &self.script_destination)
            .field("include_objects", &self.include_objects)
            .field("exclude_objects", &self.exclude_objects)
            .field("include_schemas", &self.include_schemas)
            .field("exclude_schemas", &self.exclude_schemas)
            .field("include_types", &self.include_types)
            .field("exclude_types", &self.exclude_types)
            .field("options", &self.options)
            .finish()
    }
}

fn required_str(parameters: &Map<String, Value>, key: &'static str) -> Result<String, ParameterError> {
    match parameters.get(key) {
        None | Some(Value::Null) => Err(ParameterError::Missing(key)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(ParameterError::WrongType {
            key: key.to_string(),
            expected: "a string",
        }),
    }
}

fn string_list(key: &str, value: &Value) -> Result<Vec<String>, ParameterError> {
    let wrong_type = || ParameterError::WrongType {
        key: key.to_string(),
        expected: "a list of strings",
    };

    value
        .as_array()
        .ok_or_else(wrong_type)?
        .iter()
        .map(|item| item.as_str().map(str::to_string).ok_or_else(wrong_type))
        .collect()
}

/// Builder for [`ScriptingParams`]. Option overrides are validated in `build`.
#[derive(Debug)]
pub struct ScriptingParamsBuilder {
    params: ScriptingParams,
    overrides: Map<String, Value>,
}

impl ScriptingParamsBuilder {
    pub fn script_destination(mut self, destination: impl Into<String>) -> Self {
        self.params.script_destination = destination.into();
        self
    }

    /// Objects to script, as `schema.name` or bare `name` tokens.
    pub fn include_objects<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.params.include_objects = parse_criteria(tokens);
        self
    }

    /// Objects to leave out, as `schema.name` or bare `name` tokens.
    pub fn exclude_objects<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.params.exclude_objects = parse_criteria(tokens);
        self
    }

    pub fn include_schemas<I, S>(mut self, schemas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params.include_schemas = Some(to_strings(schemas));
        self
    }

    pub fn exclude_schemas<I, S>(mut self, schemas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params.exclude_schemas = Some(to_strings(schemas));
        self
    }

    pub fn include_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params.include_types = Some(to_strings(types));
        self
    }

    pub fn exclude_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params.exclude_types = Some(to_strings(types));
        self
    }

    /// Scripting option overrides, merged over earlier calls.
    pub fn options(mut self, overrides: Map<String, Value>) -> Self {
        self.overrides.extend(overrides);
        self
    }

    /// Set a single scripting option override.
    pub fn option(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.overrides.insert(name.into(), value.into());
        self
    }

    /// Validate the option overrides and freeze the bundle.
    pub fn build(self) -> Result<ScriptingParams, InvalidOptionError> {
        let mut params = self.params;
        params.options.update_options(&self.overrides)?;
        Ok(params)
    }
}
