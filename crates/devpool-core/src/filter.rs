//! Typed device filters
//!
//! A [`DeviceFilter`] is the only query shape the pool accepts. Text fields
//! carry an explicit [`FieldMatch`] mode so exact and pattern matching are
//! never confused, and the two OS-version fields are matched as
//! alternatives of each other.

use std::fmt;

use regex::Regex;

use crate::error::{Error, Result};
use crate::types::{Device, DeviceType, Platform, Status};

/// How a single text field is matched
#[derive(Debug, Clone)]
pub enum FieldMatch {
    /// Byte-for-byte equality
    Exact(String),
    /// Regular expression search
    Pattern(Regex),
}

impl FieldMatch {
    pub fn exact(value: impl Into<String>) -> Self {
        FieldMatch::Exact(value.into())
    }

    pub fn pattern(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(FieldMatch::Pattern)
            .map_err(|e| Error::invalid_filter(format!("invalid pattern {:?}: {}", pattern, e)))
    }

    /// Parse a boundary value; `/.../` denotes a pattern, anything else is exact
    pub fn parse(value: &str) -> Result<Self> {
        match value
            .strip_prefix('/')
            .and_then(|rest| rest.strip_suffix('/'))
        {
            Some(pattern) if !pattern.is_empty() => Self::pattern(pattern),
            _ => Ok(Self::exact(value)),
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            FieldMatch::Exact(expected) => expected == value,
            FieldMatch::Pattern(re) => re.is_match(value),
        }
    }

    fn matches_opt(&self, value: Option<&str>) -> bool {
        value.is_some_and(|v| self.matches(v))
    }
}

impl PartialEq for FieldMatch {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FieldMatch::Exact(a), FieldMatch::Exact(b)) => a == b,
            (FieldMatch::Pattern(a), FieldMatch::Pattern(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

impl fmt::Display for FieldMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldMatch::Exact(value) => f.write_str(value),
            FieldMatch::Pattern(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

/// Structured query over device records
///
/// Every `None` field is a wildcard. An empty filter matches every record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceFilter {
    pub token: Option<FieldMatch>,
    pub name: Option<FieldMatch>,
    pub platform: Option<Platform>,
    pub device_type: Option<DeviceType>,
    /// Matched against both `apiLevel` and `releaseVersion`
    pub api_level: Option<FieldMatch>,
    /// Matched against both `releaseVersion` and `apiLevel`
    pub release_version: Option<FieldMatch>,
    pub status: Option<Status>,
}

impl DeviceFilter {
    /// Filter matching every record
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(FieldMatch::exact(token)),
            ..Default::default()
        }
    }

    pub fn for_platform(platform: Platform) -> Self {
        Self {
            platform: Some(platform),
            ..Default::default()
        }
    }

    /// Exact filter for a concrete record (token, name, platform, type)
    pub fn for_device(device: &Device) -> Self {
        Self {
            token: Some(FieldMatch::exact(device.token.clone())),
            name: Some(FieldMatch::exact(device.name.clone())),
            platform: Some(device.platform),
            device_type: Some(device.device_type),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: FieldMatch) -> Self {
        self.name = Some(name);
        self
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn with_device_type(mut self, device_type: DeviceType) -> Self {
        self.device_type = Some(device_type);
        self
    }

    pub fn with_api_level(mut self, api_level: FieldMatch) -> Self {
        self.api_level = Some(api_level);
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    /// The platform/OS-version portion of this filter
    ///
    /// Used to scope orphan reclamation to devices a lease request could
    /// compete for.
    pub fn scope(&self) -> DeviceFilter {
        DeviceFilter {
            platform: self.platform,
            api_level: self.api_level.clone(),
            release_version: self.release_version.clone(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == DeviceFilter::default()
    }

    pub fn matches(&self, device: &Device) -> bool {
        if let Some(ref token) = self.token {
            if !token.matches(&device.token) {
                return false;
            }
        }
        if let Some(ref name) = self.name {
            if !name.matches(&device.name) {
                return false;
            }
        }
        if self.platform.is_some_and(|p| p != device.platform) {
            return false;
        }
        if self.device_type.is_some_and(|t| t != device.device_type) {
            return false;
        }
        if self.status.is_some_and(|s| s != device.status) {
            return false;
        }
        for version in [&self.api_level, &self.release_version].into_iter().flatten() {
            if !version_matches(version, device) {
                return false;
            }
        }
        true
    }
}

/// Either OS-version field of the record may satisfy a version criterion
fn version_matches(criterion: &FieldMatch, device: &Device) -> bool {
    criterion.matches_opt(device.api_level.as_deref())
        || criterion.matches_opt(device.release_version.as_deref())
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        if let Some(ref token) = self.token {
            parts.push(format!("token={}", token));
        }
        if let Some(ref name) = self.name {
            parts.push(format!("name={}", name));
        }
        if let Some(platform) = self.platform {
            parts.push(format!("platform={}", platform));
        }
        if let Some(device_type) = self.device_type {
            parts.push(format!("type={}", device_type));
        }
        if let Some(ref api_level) = self.api_level {
            parts.push(format!("apiLevel={}", api_level));
        }
        if let Some(ref version) = self.release_version {
            parts.push(format!("releaseVersion={}", version));
        }
        if let Some(status) = self.status {
            parts.push(format!("status={}", status));
        }

        if parts.is_empty() {
            f.write_str("<all>")
        } else {
            f.write_str(&parts.join(" "))
        }
    }
}
