//! Registration strategies and how they are requested.

use crate::config::Tool;
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A registration backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegistrationMethod {
    /// Learned, contrast-agnostic deformable registration (method B).
    #[serde(rename = "synthmorph")]
    SynthMorph,
    /// Learned deformable network (method A).
    DeformableNet,
    /// Classical SyN registration (method C).
    EnhancedClassical,
}

impl RegistrationMethod {
    /// Preference order for automatic selection.
    pub const AUTO_ORDER: [Self; 3] = [Self::SynthMorph, Self::DeformableNet, Self::EnhancedClassical];

    /// CLI and record name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::SynthMorph => "synthmorph",
            Self::DeformableNet => "deformable-net",
            Self::EnhancedClassical => "enhanced-classical",
        }
    }

    /// Learned methods are quality gated; the classical method is the floor.
    #[must_use]
    pub fn is_ml(&self) -> bool {
        !matches!(self, Self::EnhancedClassical)
    }

    /// The external tool that implements this method.
    #[must_use]
    pub fn tool(&self) -> Tool {
        match self {
            Self::SynthMorph => Tool::Synthmorph,
            Self::DeformableNet => Tool::Voxelmorph,
            Self::EnhancedClassical => Tool::Ants,
        }
    }
}

impl fmt::Display for RegistrationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RegistrationMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::AUTO_ORDER
            .into_iter()
            .find(|m| m.name() == s.trim())
            .ok_or_else(|| {
                ConfigError::new(
                    "ml_method",
                    format!("'{s}' is not one of auto, deformable-net, synthmorph, enhanced-classical"),
                )
            })
    }
}

/// What the operator asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RequestedMethod {
    /// Best available, quality gated.
    #[default]
    Auto,
    /// This method, honored even when quality is poor.
    Explicit(RegistrationMethod),
}

impl RequestedMethod {
    /// Returns true for automatic selection.
    #[must_use]
    pub fn is_auto(&self) -> bool {
        matches!(self, Self::Auto)
    }
}

impl fmt::Display for RequestedMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Explicit(m) => f.write_str(m.name()),
        }
    }
}

impl FromStr for RequestedMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("auto") {
            Ok(Self::Auto)
        } else {
            s.to_ascii_lowercase().parse().map(Self::Explicit)
        }
    }
}

impl TryFrom<String> for RequestedMethod {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RequestedMethod> for String {
    fn from(value: RequestedMethod) -> Self {
        value.to_string()
    }
}

/// The route that actually produced the registered image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AppliedMethod {
    /// Rigid FSL registration used when ML registration is disabled.
    Traditional,
    /// Nothing succeeded; the moving image was passed through unregistered.
    Passthrough,
    /// One of the selectable backends.
    #[serde(untagged)]
    Method(RegistrationMethod),
}

impl fmt::Display for AppliedMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Method(m) => f.write_str(m.name()),
            Self::Traditional => f.write_str("traditional"),
            Self::Passthrough => f.write_str("passthrough"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_requested() {
        assert_eq!("auto".parse::<RequestedMethod>().unwrap(), RequestedMethod::Auto);
        assert_eq!(
            "synthmorph".parse::<RequestedMethod>().unwrap(),
            RequestedMethod::Explicit(RegistrationMethod::SynthMorph)
        );
        assert_eq!(
            "Deformable-Net".parse::<RequestedMethod>().unwrap(),
            RequestedMethod::Explicit(RegistrationMethod::DeformableNet)
        );
        assert_eq!("ants".parse::<RequestedMethod>().unwrap_err().field, "ml_method");
    }

    #[test]
    fn test_method_tools() {
        assert_eq!(RegistrationMethod::SynthMorph.tool(), Tool::Synthmorph);
        assert!(RegistrationMethod::DeformableNet.is_ml());
        assert!(!RegistrationMethod::EnhancedClassical.is_ml());
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&RequestedMethod::Explicit(RegistrationMethod::EnhancedClassical)).unwrap();
        assert_eq!(json, r#""enhanced-classical""#);
        let back: RequestedMethod = serde_json::from_str(r#""auto""#).unwrap();
        assert_eq!(back, RequestedMethod::Auto);

        assert_eq!(
            serde_json::to_string(&AppliedMethod::Method(RegistrationMethod::SynthMorph)).unwrap(),
            r#""synthmorph""#
        );
        assert_eq!(serde_json::to_string(&AppliedMethod::Traditional).unwrap(), r#""traditional""#);
        assert_eq!(AppliedMethod::Passthrough.to_string(), "passthrough");
        let back: AppliedMethod = serde_json::from_str(r#""deformable-net""#).unwrap();
        assert_eq!(back, AppliedMethod::Method(RegistrationMethod::DeformableNet));
    }
}
