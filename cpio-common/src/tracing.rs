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

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::SafeDisplay;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TracingConfig {
    pub service_name: String,
    pub stdout: StdoutLayerConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StdoutLayerConfig {
    pub enabled: bool,
    pub json: bool,
    pub ansi: bool,
}

impl TracingConfig {
    pub fn local_dev(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            stdout: StdoutLayerConfig {
                enabled: true,
                json: false,
                ansi: true,
            },
        }
    }

    pub fn deployed(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            stdout: StdoutLayerConfig {
                enabled: true,
                json: true,
                ansi: false,
            },
        }
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::local_dev("cpio")
    }
}

impl SafeDisplay for TracingConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "service name: {}, stdout enabled: {}, json: {}",
            self.service_name, self.stdout.enabled, self.stdout.json
        )
    }
}

/// Initializes the global tracing subscriber, filtered by `RUST_LOG` when set
/// and at `info` otherwise.
pub fn init_tracing_with_default_env_filter(config: &TracingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if !config.stdout.enabled {
        tracing_subscriber::registry().with(filter).init();
    } else if config.stdout.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_ansi(config.stdout.ansi))
            .init();
    }
}
