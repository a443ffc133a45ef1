//! Boundary parsing of loosely-typed request parameters
//!
//! Callers outside the engine (CLI arguments, query strings) speak in flat
//! `key=value` pairs. This module turns them into a [`DeviceQuery`] or a
//! [`DevicePatch`], rejecting anything it does not understand so that
//! malformed requests never reach pool state.

use crate::error::{Error, Result};
use crate::filter::{DeviceFilter, FieldMatch};
use crate::types::{BootOptions, DevicePatch};

/// Lease request handed to the engine
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscribeRequest {
    pub filter: DeviceFilter,
    /// Free-text owner description stamped on the lease
    pub info: Option<String>,
    /// Pid of the client process holding the lease
    pub parent_process_pid: Option<u32>,
    /// Kill matching idle devices before choosing a candidate
    pub restart: bool,
}

impl SubscribeRequest {
    pub fn new(filter: DeviceFilter) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = Some(info.into());
        self
    }

    pub fn with_parent_pid(mut self, pid: u32) -> Self {
        self.parent_process_pid = Some(pid);
        self
    }

    pub fn with_restart(mut self, restart: bool) -> Self {
        self.restart = restart;
        self
    }
}

/// Every parameter a boundary request may carry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceQuery {
    pub filter: DeviceFilter,
    pub info: Option<String>,
    pub parent_process_pid: Option<u32>,
    pub restart: bool,
    pub count: Option<usize>,
    pub options: BootOptions,
}

impl DeviceQuery {
    /// Build a query from raw key/value pairs
    ///
    /// Empty and false-y values are dropped, a leading `_` on a key is
    /// ignored, and unknown keys are rejected.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut query = DeviceQuery::default();

        for (key, value) in pairs {
            let key = normalize_key(key.as_ref());
            let value = value.as_ref().trim();
            if value.is_empty() {
                continue;
            }

            match key {
                "token" => query.filter.token = Some(FieldMatch::parse(value)?),
                "name" => query.filter.name = Some(FieldMatch::parse(value)?),
                "platform" => query.filter.platform = Some(value.parse()?),
                "type" => query.filter.device_type = Some(value.parse()?),
                "apiLevel" => query.filter.api_level = Some(FieldMatch::parse(value)?),
                "releaseVersion" => {
                    query.filter.release_version = Some(FieldMatch::parse(value)?)
                }
                "status" => query.filter.status = Some(value.parse()?),
                "info" => query.info = Some(value.to_string()),
                "parentProcessPid" => {
                    query.parent_process_pid = parse_number::<u32>(key, value)?.filter(|p| *p != 0)
                }
                "restart" => query.restart = parse_flag(key, value)?,
                "count" => query.count = parse_number::<usize>(key, value)?.filter(|c| *c != 0),
                "options" => query.options = BootOptions::from_flags(value)?,
                other => {
                    return Err(Error::invalid_filter(format!("unknown key: {}", other)));
                }
            }
        }

        Ok(query)
    }

    /// Parse a URL query string (`a=1&b=2`, leading `?` allowed)
    pub fn from_query_str(query: &str) -> Result<Self> {
        let query = query.trim_start_matches('?');
        Self::from_pairs(url::form_urlencoded::parse(query.as_bytes()))
    }

    /// Parse `key=value` command-line arguments
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        Self::from_pairs(split_args(args)?)
    }

    pub fn subscribe_request(&self) -> SubscribeRequest {
        SubscribeRequest {
            filter: self.filter.clone(),
            info: self.info.clone(),
            parent_process_pid: self.parent_process_pid,
            restart: self.restart,
        }
    }

    /// Number of devices to boot; defaults to one
    pub fn boot_count(&self) -> usize {
        self.count.unwrap_or(1)
    }
}

/// Build a record patch from `key=value` pairs
///
/// An empty value clears an optional field.
pub fn patch_from_pairs<I, K, V>(pairs: I) -> Result<DevicePatch>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut patch = DevicePatch::default();

    for (key, value) in pairs {
        let key = normalize_key(key.as_ref());
        let value = value.as_ref().trim();
        let text = (!value.is_empty()).then(|| value.to_string());

        match key {
            "name" => patch.name = text,
            "apiLevel" => patch.api_level = Some(text),
            "releaseVersion" => patch.release_version = Some(text),
            "status" if !value.is_empty() => patch.status = Some(value.parse()?),
            "info" => patch.info = Some(text),
            "parentProcessPid" => patch.parent_process_pid = Some(parse_number(key, value)?),
            "pid" => patch.pid = Some(parse_number(key, value)?),
            "startedAt" => patch.started_at = parse_number(key, value)?,
            "busySince" => patch.busy_since = parse_number(key, value)?,
            "status" => {}
            other => {
                return Err(Error::invalid_filter(format!(
                    "field cannot be updated: {}",
                    other
                )));
            }
        }
    }

    if patch.is_empty() {
        return Err(Error::invalid_filter("update carries no fields"));
    }
    Ok(patch)
}

/// Split `key=value` arguments into pairs
pub fn split_args<S: AsRef<str>>(args: &[S]) -> Result<Vec<(String, String)>> {
    args.iter()
        .map(|arg| {
            let arg = arg.as_ref();
            arg.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| {
                    Error::invalid_filter(format!("expected key=value, got {:?}", arg))
                })
        })
        .collect()
}

fn normalize_key(key: &str) -> &str {
    let key = key.trim();
    key.strip_prefix('_').unwrap_or(key)
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(Error::invalid_filter(format!(
            "{} expects a boolean, got {:?}",
            key, value
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<Option<T>> {
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse::<T>()
        .map(Some)
        .map_err(|_| Error::invalid_filter(format!("{} expects a number, got {:?}", key, value)))
}
