// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::anyhow::{
    bail,
    Result,
};
use ::clap::{
    Arg,
    ArgMatches,
    Command,
};

//==============================================================================
// Program Arguments
//==============================================================================

/// Program Arguments
#[derive(Debug)]
pub struct ProgramArguments {
    /// Path to a configuration file.
    config_path: Option<String>,
    /// Number of producer jobs.
    producers: usize,
    /// Number of consumer jobs.
    consumers: usize,
    /// Items pushed by each producer.
    items: usize,
}

/// Associate functions for Program Arguments
impl ProgramArguments {
    const DEFAULT_PRODUCERS: usize = 4;
    const DEFAULT_CONSUMERS: usize = 16;
    const DEFAULT_ITEMS: usize = 256;

    /// Parses the program arguments from the command line interface.
    pub fn new(app_name: &'static str, app_author: &'static str, app_about: &'static str) -> Result<Self> {
        let matches: ArgMatches = Command::new(app_name)
            .author(app_author)
            .about(app_about)
            .arg(
                Arg::new("config")
                    .long("config")
                    .value_parser(clap::value_parser!(String))
                    .required(false)
                    .value_name("PATH")
                    .help("Sets the configuration file"),
            )
            .arg(
                Arg::new("producers")
                    .long("producers")
                    .value_parser(clap::value_parser!(String))
                    .required(false)
                    .value_name("COUNT")
                    .help("Sets the number of producer jobs"),
            )
            .arg(
                Arg::new("consumers")
                    .long("consumers")
                    .value_parser(clap::value_parser!(String))
                    .required(false)
                    .value_name("COUNT")
                    .help("Sets the number of consumer jobs"),
            )
            .arg(
                Arg::new("items")
                    .long("items")
                    .value_parser(clap::value_parser!(String))
                    .required(false)
                    .value_name("COUNT")
                    .help("Sets the number of items pushed by each producer"),
            )
            .get_matches();

        let mut args: ProgramArguments = ProgramArguments {
            config_path: None,
            producers: Self::DEFAULT_PRODUCERS,
            consumers: Self::DEFAULT_CONSUMERS,
            items: Self::DEFAULT_ITEMS,
        };

        if let Some(path) = matches.get_one::<String>("config") {
            args.config_path = Some(path.to_string());
        }
        if let Some(producers) = matches.get_one::<String>("producers") {
            args.producers = Self::parse_count("producers", producers)?;
        }
        if let Some(consumers) = matches.get_one::<String>("consumers") {
            args.consumers = Self::parse_count("consumers", consumers)?;
        }
        if let Some(items) = matches.get_one::<String>("items") {
            args.items = Self::parse_count("items", items)?;
        }

        Ok(args)
    }

    pub fn get_config_path(&self) -> Option<&str> {
        self.config_path.as_deref()
    }

    pub fn get_producers(&self) -> usize {
        self.producers
    }

    pub fn get_consumers(&self) -> usize {
        self.consumers
    }

    pub fn get_items(&self) -> usize {
        self.items
    }

    fn parse_count(name: &str, value: &str) -> Result<usize> {
        let count: usize = value.parse()?;
        if count == 0 {
            bail!("invalid number of {}", name)
        }
        Ok(count)
    }
}
