//! Stream transport seam.
//!
//! Strata does not implement a network transport itself. It consumes a
//! time-synchronized publish/subscribe streaming library through the traits
//! in this module:
//!
//! - [`StreamInfo::new`] describes a named stream (the "stream handle")
//! - [`StreamProvider`] creates outlets/inlets and discovers streams
//! - [`StreamOutlet`] publishes samples
//! - [`StreamInlet`] pulls samples and estimates the remote clock offset

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Value type carried by every channel of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelFormat {
    Float32,
    Double64,
    String,
    Int32,
    Int16,
    Int8,
    Int64,
}

/// One multi-channel sample payload, typed by channel format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", content = "values", rename_all = "lowercase")]
pub enum SampleData {
    Float32(Vec<f32>),
    Double64(Vec<f64>),
    String(Vec<String>),
    Int32(Vec<i32>),
    Int16(Vec<i16>),
    Int8(Vec<i8>),
    Int64(Vec<i64>),
}

impl SampleData {
    pub fn format(&self) -> ChannelFormat {
        match self {
            Self::Float32(_) => ChannelFormat::Float32,
            Self::Double64(_) => ChannelFormat::Double64,
            Self::String(_) => ChannelFormat::String,
            Self::Int32(_) => ChannelFormat::Int32,
            Self::Int16(_) => ChannelFormat::Int16,
            Self::Int8(_) => ChannelFormat::Int8,
            Self::Int64(_) => ChannelFormat::Int64,
        }
    }

    pub fn channel_count(&self) -> usize {
        match self {
            Self::Float32(v) => v.len(),
            Self::Double64(v) => v.len(),
            Self::String(v) => v.len(),
            Self::Int32(v) => v.len(),
            Self::Int16(v) => v.len(),
            Self::Int8(v) => v.len(),
            Self::Int64(v) => v.len(),
        }
    }

    /// Single-channel string sample
    pub fn text(value: impl Into<String>) -> Self {
        Self::String(vec![value.into()])
    }

    /// First channel of a string sample
    pub fn first_text(&self) -> Option<&str> {
        match self {
            Self::String(v) => v.first().map(String::as_str),
            _ => None,
        }
    }

    /// Zero-filled sample matching a stream shape
    pub fn zeroed(format: ChannelFormat, channels: usize) -> Self {
        match format {
            ChannelFormat::Float32 => Self::Float32(vec![0.0; channels]),
            ChannelFormat::Double64 => Self::Double64(vec![0.0; channels]),
            ChannelFormat::String => Self::String(vec![String::new(); channels]),
            ChannelFormat::Int32 => Self::Int32(vec![0; channels]),
            ChannelFormat::Int16 => Self::Int16(vec![0; channels]),
            ChannelFormat::Int8 => Self::Int8(vec![0; channels]),
            ChannelFormat::Int64 => Self::Int64(vec![0; channels]),
        }
    }
}

/// A timestamped sample as delivered by an inlet
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Capture time on the producer's local clock (seconds)
    pub timestamp: f64,
    pub data: SampleData,
}

/// Description of a named stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub name: String,
    pub content_type: String,
    pub channel_count: usize,
    /// Nominal sampling rate in Hz (0 = irregular)
    pub nominal_srate: f64,
    pub channel_format: ChannelFormat,
    pub source_id: String,
    /// Provider-assigned identity of the live outlet (empty until published)
    #[serde(default)]
    pub uid: String,
}

impl StreamInfo {
    pub fn new(
        name: impl Into<String>,
        content_type: impl Into<String>,
        channel_count: usize,
        nominal_srate: f64,
        channel_format: ChannelFormat,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            channel_count,
            nominal_srate,
            channel_format,
            source_id: source_id.into(),
            uid: String::new(),
        }
    }

    /// Check that a payload fits this stream's shape
    pub fn accepts(&self, data: &SampleData) -> bool {
        data.format() == self.channel_format && data.channel_count() == self.channel_count
    }
}

/// Typed discovery predicate (all set fields must match)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamQuery {
    pub name: Option<String>,
    pub content_type: Option<String>,
    pub source_id_prefix: Option<String>,
}

impl StreamQuery {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_source_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.source_id_prefix = Some(prefix.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn matches(&self, info: &StreamInfo) -> bool {
        self.name.as_ref().is_none_or(|n| *n == info.name)
            && self
                .content_type
                .as_ref()
                .is_none_or(|t| *t == info.content_type)
            && self
                .source_id_prefix
                .as_ref()
                .is_none_or(|p| info.source_id.starts_with(p.as_str()))
    }
}

/// Publishing side of a stream
pub trait StreamOutlet: Send + Sync {
    fn info(&self) -> &StreamInfo;

    /// Push one sample stamped with the local clock
    fn push(&self, data: SampleData) -> Result<()>;

    fn have_consumers(&self) -> bool;

    /// Block until at least one inlet is attached; `Ok(false)` on timeout
    fn wait_for_consumers(&self, timeout: Duration) -> Result<bool>;
}

/// Subscribing side of a stream
pub trait StreamInlet: Send {
    fn info(&self) -> &StreamInfo;

    /// Pull the next sample, waiting at most `timeout` (zero = non-blocking)
    fn pull(&mut self, timeout: Duration) -> Result<Option<Sample>>;

    /// Seconds to add to remote timestamps to map them onto the local clock.
    /// Fails with a timeout error if no estimate is available in time.
    fn time_correction(&mut self, timeout: Duration) -> Result<f64>;

    fn samples_available(&self) -> usize;
}

/// Factory and discovery service of the underlying streaming library
pub trait StreamProvider: Send + Sync {
    fn create_outlet(
        &self,
        info: StreamInfo,
        chunk_size: usize,
        buffer_size: usize,
    ) -> Result<Box<dyn StreamOutlet>>;

    fn discover_streams(
        &self,
        query: &StreamQuery,
        wait_time: Duration,
        max_results: usize,
    ) -> Result<Vec<StreamInfo>>;

    fn create_inlet(
        &self,
        info: &StreamInfo,
        buffer_size: usize,
        chunk_size: usize,
        recover: bool,
    ) -> Result<Box<dyn StreamInlet>>;

    /// Monotonic local clock in seconds
    fn local_clock(&self) -> f64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_matching() {
        let info = StreamInfo::new("game", "Game", 3, 0.0, ChannelFormat::Float32, "game_node-1");
        assert!(StreamQuery::by_name("game").matches(&info));
        assert!(StreamQuery::by_name("game").with_source_prefix("game_").matches(&info));
        assert!(!StreamQuery::by_name("game").with_source_prefix("coord_").matches(&info));
        assert!(!StreamQuery::by_name("other").matches(&info));
        assert!(StreamQuery::default().with_content_type("Game").matches(&info));
    }

    #[test]
    fn test_stream_accepts_shape() {
        let info = StreamInfo::new("x", "X", 2, 100.0, ChannelFormat::Float32, "x_1");
        assert!(info.accepts(&SampleData::Float32(vec![1.0, 2.0])));
        assert!(!info.accepts(&SampleData::Float32(vec![1.0])));
        assert!(!info.accepts(&SampleData::Double64(vec![1.0, 2.0])));
    }

    #[test]
    fn test_sample_data_serialization() {
        let data = SampleData::Int16(vec![1, -2]);
        let json = serde_json::to_string(&data).unwrap();
        assert_eq!(json, r#"{"format":"int16","values":[1,-2]}"#);
        assert_eq!(SampleData::text("hi").first_text(), Some("hi"));
        assert_eq!(SampleData::zeroed(ChannelFormat::Int8, 4).channel_count(), 4);
    }
}
