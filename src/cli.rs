//! Command-line argument parsing for Quarry.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::EngineConfig;
use crate::template::{Scalar, TemplateValue};

/// How results are written to stdout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Tab-separated values with a header line.
    #[default]
    Tsv,
    /// One JSON object per row.
    Json,
}

/// Run SQL on Athena and read the results.
#[derive(Parser, Debug)]
#[command(name = "quarry")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a query and print its full result set
    Query {
        /// SQL text, or a path to a .sql file
        #[arg(value_name = "SQL")]
        sql: String,

        #[command(flatten)]
        params: ParamArgs,

        /// Column parsed as a timestamp (repeatable, replaces the configured set)
        #[arg(long = "date-field", value_name = "COLUMN")]
        date_fields: Vec<String>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Tsv)]
        format: OutputFormat,
    },

    /// Persist a query's output as a table
    CreateTable {
        /// SQL text, or a path to a .sql file
        #[arg(value_name = "SQL")]
        sql: String,

        #[command(flatten)]
        params: ParamArgs,

        /// Table name; generated from --prefix when omitted
        #[arg(long)]
        name: Option<String>,

        #[arg(long, default_value = crate::engine::DEFAULT_TABLE_PREFIX)]
        prefix: String,

        /// Drop the table and its data first
        #[arg(long)]
        overwrite: bool,
    },

    /// Run a statement and stream its result set
    Exec {
        /// SQL text, or a path to a .sql file
        #[arg(value_name = "SQL")]
        sql: String,

        #[command(flatten)]
        params: ParamArgs,

        #[arg(long)]
        database: Option<String>,

        /// Rows per batch (at most 1000)
        #[arg(long, default_value_t = crate::service::MAX_PAGE_SIZE)]
        batch_size: usize,

        #[arg(long, value_enum, default_value_t = OutputFormat::Tsv)]
        format: OutputFormat,
    },

    /// Cancel a running query
    Cancel {
        #[arg(value_name = "EXECUTION_ID")]
        execution_id: String,
    },
}

/// Template parameters given on the command line.
#[derive(Args, Debug, Default, Clone)]
pub struct ParamArgs {
    /// Literal parameter; numbers and true/false are typed, anything else is a string
    #[arg(long = "param", value_name = "NAME=VALUE", value_parser = parse_key_value)]
    pub params: Vec<(String, String)>,

    /// Identifier parameter, e.g. `table=main.users`
    #[arg(long = "ident", value_name = "NAME=IDENT", value_parser = parse_key_value)]
    pub idents: Vec<(String, String)>,

    /// List parameter, comma separated
    #[arg(long = "list", value_name = "NAME=A,B", value_parser = parse_key_value)]
    pub lists: Vec<(String, String)>,

    /// Raw SQL fragment, inserted verbatim
    #[arg(long = "raw", value_name = "NAME=EXPR", value_parser = parse_key_value)]
    pub raws: Vec<(String, String)>,
}

impl ParamArgs {
    /// Converts the arguments to template values. Later flags win on
    /// duplicate names.
    pub fn to_template_params(&self) -> BTreeMap<String, TemplateValue> {
        let mut params = BTreeMap::new();

        for (name, value) in &self.params {
            params.insert(name.clone(), TemplateValue::Scalar(infer_scalar(value)));
        }
        for (name, value) in &self.idents {
            let parts = value.split('.').map(str::to_string).collect();
            params.insert(name.clone(), TemplateValue::QualifiedName(parts));
        }
        for (name, value) in &self.lists {
            let items = if value.is_empty() {
                Vec::new()
            } else {
                value.split(',').map(|item| infer_scalar(item.trim())).collect()
            };
            params.insert(name.clone(), TemplateValue::List(items));
        }
        for (name, value) in &self.raws {
            params.insert(name.clone(), TemplateValue::raw(value.clone()));
        }

        params
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid parameter: '{s}'. Expected NAME=VALUE"))?;
    if key.is_empty() {
        return Err(format!("Invalid parameter: '{s}'. Name is empty"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Integers, floats and booleans get their own type; everything else is a
/// string.
fn infer_scalar(raw: &str) -> Scalar {
    if let Ok(i) = raw.parse::<i64>() {
        return Scalar::Int(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        if f.is_finite() {
            return Scalar::Float(f);
        }
    }
    match raw {
        "true" => Scalar::Bool(true),
        "false" => Scalar::Bool(false),
        _ => Scalar::String(raw.to_string()),
    }
}

impl Command {
    /// Output format of commands that print rows.
    pub fn output_format(&self) -> OutputFormat {
        match self {
            Self::Query { format, .. } | Self::Exec { format, .. } => *format,
            Self::CreateTable { .. } | Self::Cancel { .. } => OutputFormat::Tsv,
        }
    }
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Returns the config file path to use.
    ///
    /// Uses the --config argument if provided, otherwise the default path.
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(EngineConfig::default_path)
    }
}
