// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::SafeDisplay;

/// Environment variable prefix recognized by every CPIO binary. A field
/// `a.b.c` of the config struct is overridable as `CPIO__A__B__C`.
const ENV_PREFIX: &str = "CPIO__";
const ENV_SEPARATOR: &str = "__";

pub trait ConfigLoaderConfig: Default + Serialize + DeserializeOwned {}

impl<T: Default + Serialize + DeserializeOwned> ConfigLoaderConfig for T {}

pub type ConfigExample<T> = (&'static str, T);

pub trait HasConfigExamples<T> {
    fn examples() -> Vec<ConfigExample<T>>;
}

/// Layered configuration loader: defaults from the config struct's `Default`
/// implementation, overridden by the TOML config file (if present),
/// overridden by `CPIO__` environment variables.
pub struct ConfigLoader<T: ConfigLoaderConfig> {
    pub config_file_name: PathBuf,
    make_examples: Option<fn() -> Vec<ConfigExample<T>>>,
    phantom: PhantomData<T>,
}

impl<T: ConfigLoaderConfig> ConfigLoader<T> {
    pub fn new(config_file_name: &Path) -> ConfigLoader<T> {
        ConfigLoader {
            config_file_name: config_file_name.to_path_buf(),
            make_examples: None,
            phantom: PhantomData,
        }
    }

    pub fn new_with_examples(config_file_name: &Path) -> ConfigLoader<T>
    where
        T: HasConfigExamples<T>,
    {
        ConfigLoader {
            config_file_name: config_file_name.to_path_buf(),
            make_examples: Some(T::examples),
            phantom: PhantomData,
        }
    }

    pub fn figment(&self) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(T::default()))
            .merge(Toml::file(&self.config_file_name))
            .merge(Env::prefixed(ENV_PREFIX).split(ENV_SEPARATOR))
    }

    pub fn load(&self) -> figment::Result<T> {
        self.figment().extract()
    }

    fn dump(&self) {
        match toml::to_string(&T::default()) {
            Ok(rendered) => println!("{rendered}"),
            Err(err) => eprintln!("Failed to render the default config: {err}"),
        }
        if let Some(make_examples) = self.make_examples {
            for (name, example) in make_examples() {
                println!("\n## Example: {name}\n");
                match toml::to_string(&example) {
                    Ok(rendered) => println!("{rendered}"),
                    Err(err) => eprintln!("Failed to render example '{name}': {err}"),
                }
            }
        }
    }

    /// Loads the config, or dumps the default config (and examples, if any)
    /// when the process was started with `--dump-config`. Returns `None`
    /// after dumping, and also when loading failed after printing the
    /// failure to stderr; callers are expected to exit in both cases.
    pub fn load_or_dump_config(&self) -> Option<T> {
        if std::env::args().any(|arg| arg == "--dump-config") {
            self.dump();
            None
        } else {
            match self.load() {
                Ok(config) => Some(config),
                Err(err) => {
                    eprintln!(
                        "Failed to load config from {}: {err}",
                        self.config_file_name.display()
                    );
                    None
                }
            }
        }
    }
}

/// Retry policy of an outgoing operation, driven by
/// [`crate::retries::with_retries`]. The delay before attempt `n + 1` is
/// `min_delay * multiplier^(n - 1)`, capped at `max_delay`, with optional
/// proportional jitter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_jitter_factor: Option<f64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_jitter_factor: Some(0.15),
        }
    }
}

impl RetryConfig {
    pub fn no_retries() -> RetryConfig {
        RetryConfig {
            max_attempts: 1,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            max_jitter_factor: None,
        }
    }
}

impl SafeDisplay for RetryConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "max attempts: {}, min delay: {:?}, max delay: {:?}, multiplier: {}",
            self.max_attempts, self.min_delay, self.max_delay, self.multiplier
        )
    }
}
