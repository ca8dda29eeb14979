use chrono::{DateTime, Utc};
use clap::Parser;

use corelib::{JobParameters, ParameterValue};

/// Name of the parameter that makes every run its own job instance.
pub const RUN_ID_PARAM: &str = "run.id";

#[derive(Debug, Parser)]
#[clap(name = "batchd", version, about = "Runs a partitioned batch job across a local worker pool")]
pub struct Cli {
    /// Job to launch
    #[clap(long, default_value = "partitioned-count")]
    pub job: String,

    /// Partitions per run (overrides BATCHD_GRID_SIZE)
    #[clap(long)]
    pub grid_size: Option<usize>,

    /// Items each partition processes
    #[clap(long, default_value_t = 100)]
    pub items_per_partition: u64,

    /// Job parameter as key=value; prefix the key with '-' to make it
    /// non-identifying. Repeatable.
    #[clap(long = "param", value_parser = parse_param, allow_hyphen_values = true)]
    pub params: Vec<(String, JobParameterArg)>,

    /// Number of launches
    #[clap(long, default_value_t = 1)]
    pub runs: u64,

    /// Launch all runs at once instead of one after the other
    #[clap(long)]
    pub concurrent: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobParameterArg {
    pub value: ParameterValue,
    pub identifying: bool,
}

/// `key=value`; the value is typed as long, then double, then RFC 3339
/// date, then string.
fn parse_param(raw: &str) -> Result<(String, JobParameterArg), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;

    let (key, identifying) = match key.strip_prefix('-') {
        Some(k) => (k, false),
        None => (key, true),
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in '{raw}'"));
    }

    let value = if let Ok(v) = value.parse::<i64>() {
        ParameterValue::Long(v)
    } else if let Ok(v) = value.parse::<f64>() {
        ParameterValue::Double(v)
    } else if let Ok(v) = DateTime::parse_from_rfc3339(value) {
        ParameterValue::Date(v.with_timezone(&Utc))
    } else {
        ParameterValue::String(value.to_string())
    };

    Ok((key.to_string(), JobParameterArg { value, identifying }))
}

impl Cli {
    /// Parameters for the `run`-th launch. Each run gets its own identifying
    /// `run.id` unless one was given explicitly.
    pub fn job_parameters(&self, run: u64) -> JobParameters {
        let mut params = JobParameters::new();
        for (key, arg) in &self.params {
            params = params.with(key.clone(), arg.value.clone(), arg.identifying);
        }
        if params.get(RUN_ID_PARAM).is_none() {
            params = params.with_long(RUN_ID_PARAM, Utc::now().timestamp_millis() * 1_000 + run as i64);
        }
        params
    }
}
