// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    logging::DEFAULT_LOG_SPEC,
};
use ::std::{
    fs::File,
    io::Read,
    ops::Index,
    str::FromStr,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Constants
//======================================================================================================================

// Task pool options.
mod task_pool_config {
    pub const SECTION_NAME: &str = "task_pool";
    // Soft limit on the number of busy execution contexts.
    pub const CAPACITY: &str = "capacity";
}

// Logging options.
mod logging_config {
    pub const SECTION_NAME: &str = "logging";
    // Log specification in the format understood by flexi_logger.
    pub const SPEC: &str = "spec";
}

/// Capacity used when the configuration does not provide one.
pub const DEFAULT_CAPACITY: usize = 10000;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Scheduler configuration.
#[derive(Clone, Debug)]
pub struct Config(pub Yaml);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Config {
    /// Reads a configuration file into a [Config] object.
    pub fn new(config_path: &str) -> Result<Self, Fail> {
        let mut config_s: String = String::new();
        File::open(config_path)?.read_to_string(&mut config_s)?;
        config_s.parse()
    }

    /// Task pool config: Reads the pool capacity from the environment variable first and then the underlying
    /// configuration file.
    pub fn capacity(&self) -> Result<usize, Fail> {
        let capacity: usize = if let Some(capacity) = Self::get_typed_env_option(task_pool_config::CAPACITY)? {
            capacity
        } else {
            match self.get_section(task_pool_config::SECTION_NAME)? {
                Some(section) => match Self::get_option(section, task_pool_config::CAPACITY) {
                    Some(_) => Self::get_int_option(section, task_pool_config::CAPACITY)?,
                    None => DEFAULT_CAPACITY,
                },
                None => DEFAULT_CAPACITY,
            }
        };

        if capacity == 0 {
            let cause: String = "pool capacity must be positive".to_string();
            error!("capacity(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        Ok(capacity)
    }

    /// Logging config: Reads the log specification from the environment variable first and then the underlying
    /// configuration file.
    pub fn log_spec(&self) -> Result<String, Fail> {
        if let Some(spec) = Self::get_typed_env_option(logging_config::SPEC)? {
            return Ok(spec);
        }
        match self.get_section(logging_config::SECTION_NAME)? {
            Some(section) => match Self::get_option(section, logging_config::SPEC) {
                Some(option) => match option.as_str() {
                    Some(spec) => Ok(spec.to_string()),
                    None => {
                        let message: String = format!("parameter {} has unexpected type", logging_config::SPEC);
                        Err(Fail::new(libc::EINVAL, message.as_str()))
                    },
                },
                None => Ok(DEFAULT_LOG_SPEC.to_string()),
            },
            None => Ok(DEFAULT_LOG_SPEC.to_string()),
        }
    }

    /// Looks up a top-level section. A missing section is not an error.
    fn get_section(&self, index: &str) -> Result<Option<&Yaml>, Fail> {
        match Self::get_option(&self.0, index) {
            Some(section @ Yaml::Hash(_)) => Ok(Some(section)),
            Some(_) => {
                let message: String = format!("parameter \"{}\" has unexpected type", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
            None => Ok(None),
        }
    }

    /// Index `yaml` to find the value at `index`.
    fn get_option<'a>(yaml: &'a Yaml, index: &str) -> Option<&'a Yaml> {
        match yaml.index(index) {
            Yaml::BadValue | Yaml::Null => None,
            value => Some(value),
        }
    }

    /// Get value where the environment value overrides the config file if it exists.
    fn get_typed_env_option<T: FromStr>(index: &str) -> Result<Option<T>, Fail> {
        // Check for the environment variable.
        if let Ok(var) = ::std::env::var(index.to_uppercase()) {
            if let Ok(value) = var.as_str().parse() {
                return Ok(Some(value));
            } else {
                let message: String = format!("parameter {} has unexpected type", index);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            }
        }
        Ok(None)
    }

    /// Reads an integer option, verifying that the destination type may hold the i64 value.
    fn get_int_option<T: TryFrom<i64>>(yaml: &Yaml, index: &str) -> Result<T, Fail> {
        let val: i64 = match Self::get_option(yaml, index).and_then(Yaml::as_i64) {
            Some(val) => val,
            None => {
                let message: String = format!("parameter {} has unexpected type", index);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            },
        };
        match T::try_from(val) {
            Ok(val) => Ok(val),
            _ => {
                let message: String = format!("parameter \"{}\" is out of range", index);
                Err(Fail::new(libc::ERANGE, message.as_str()))
            },
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl FromStr for Config {
    type Err = Fail;

    /// Parses a configuration from YAML text.
    fn from_str(config_s: &str) -> Result<Self, Fail> {
        let config: Vec<Yaml> = match YamlLoader::load_from_str(config_s) {
            Ok(config) => config,
            Err(e) => {
                let cause: String = format!("failed to parse configuration: {}", e);
                error!("from_str(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        match &config[..] {
            [c] => Ok(Self(c.clone())),
            [] => Ok(Self(Yaml::Hash(Default::default()))),
            _ => Err(Fail::new(libc::EINVAL, "Wrong number of config objects")),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self(Yaml::Hash(Default::default()))
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
