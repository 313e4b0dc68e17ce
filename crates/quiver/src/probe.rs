//! Host feature detection for optional tool variants.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use wasmtime::{Config, Engine, Module};

/// Optional instruction-set extension a tool variant can depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    /// 128-bit WebAssembly SIMD
    Simd,
}

impl Feature {
    /// Suffix appended to a program name for the variant built with this
    /// feature (`ssw` becomes `ssw-simd`).
    pub fn suffix(self) -> &'static str {
        match self {
            Feature::Simd => "simd",
        }
    }
}

/// Reports whether the host can run a feature variant.
pub trait FeatureProbe: Send + Sync + std::fmt::Debug {
    /// Whether `feature` is available.
    fn supports(&self, feature: Feature) -> bool;
}

/// Probe that asks wasmtime: a feature is available when an engine with it
/// enabled can be built for this host and compiles a module using it.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostFeatureProbe;

impl FeatureProbe for HostFeatureProbe {
    fn supports(&self, feature: Feature) -> bool {
        static SIMD: OnceLock<bool> = OnceLock::new();
        match feature {
            Feature::Simd => *SIMD.get_or_init(|| engine_supports(feature)),
        }
    }
}

/// Smallest module that needs `feature`.
fn feature_module(feature: Feature) -> &'static str {
    match feature {
        Feature::Simd => "(module (func (result v128) (v128.const i64x2 0 0)))",
    }
}

fn engine_supports(feature: Feature) -> bool {
    let mut config = Config::new();
    match feature {
        Feature::Simd => config.wasm_simd(true),
    };
    let result = Engine::new(&config)
        .and_then(|engine| Module::new(&engine, feature_module(feature)).map(drop));
    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(?feature, error = %e, "host lacks feature");
            false
        }
    }
}

/// Probe with a fixed answer, for embedding and tests.
#[derive(Debug, Default, Clone)]
pub struct FixedFeatureProbe {
    supported: Vec<Feature>,
}

impl FixedFeatureProbe {
    /// Probe reporting exactly `supported` as available.
    pub fn new(supported: impl IntoIterator<Item = Feature>) -> Self {
        Self {
            supported: supported.into_iter().collect(),
        }
    }
}

impl FeatureProbe for FixedFeatureProbe {
    fn supports(&self, feature: Feature) -> bool {
        self.supported.contains(&feature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_probe() {
        assert!(FixedFeatureProbe::new([Feature::Simd]).supports(Feature::Simd));
        assert!(!FixedFeatureProbe::default().supports(Feature::Simd));
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn test_host_simd_matches_engine() {
        assert!(HostFeatureProbe.supports(Feature::Simd));
        assert!(engine_supports(Feature::Simd));
    }

    #[test]
    fn test_suffix() {
        assert_eq!(Feature::Simd.suffix(), "simd");
    }
}
