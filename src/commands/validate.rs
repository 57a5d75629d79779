use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OpenFlags, params};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cli::ValidateArgs;
use crate::commands::extract::{STAGING_DB_FILENAME, table_exists};
use crate::records::{CheckboxState, ParameterRecord};
use crate::util::{now_utc_string, read_json, write_json_pretty};

const VALIDATION_REPORT_FILENAME: &str = "validation_report.json";

mod compare;
mod run;
mod staged;

pub use run::run;

use compare::*;
use staged::*;
