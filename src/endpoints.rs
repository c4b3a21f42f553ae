use url::Url;

use crate::error::{LinkError, LinkResult};

/// Logical streams carried over the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Video,
    Thermal,
    Telemetry,
    Command,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 4] = [
        ChannelKind::Video,
        ChannelKind::Thermal,
        ChannelKind::Telemetry,
        ChannelKind::Command,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ChannelKind::Video => "video",
            ChannelKind::Thermal => "thermal",
            ChannelKind::Telemetry => "telemetry",
            ChannelKind::Command => "command",
        }
    }
}

/// Image streams (the subset of channels that carry frames)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Video,
    Thermal,
}

impl StreamKind {
    pub fn name(&self) -> &'static str {
        match self {
            StreamKind::Video => "video",
            StreamKind::Thermal => "thermal",
        }
    }

    pub fn channel(&self) -> ChannelKind {
        match self {
            StreamKind::Video => ChannelKind::Video,
            StreamKind::Thermal => ChannelKind::Thermal,
        }
    }
}

/// Addresses for one robot on one server
#[derive(Debug, Clone)]
pub struct Endpoints {
    http_base: Url,
    ws_base: Url,
    robot_id: String,
}

impl Endpoints {
    /// Derive websocket and pull endpoints from an `http(s)://` base address.
    pub fn from_base(base: &str, robot_id: &str) -> LinkResult<Self> {
        let trimmed = base.trim();
        if trimmed.is_empty() {
            return Err(LinkError::MissingServer);
        }

        let mut http_base =
            Url::parse(trimmed).map_err(|e| LinkError::InvalidServer(format!("{trimmed}: {e}")))?;
        let ws_scheme = match http_base.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => {
                return Err(LinkError::InvalidServer(format!(
                    "unsupported scheme '{other}'"
                )))
            }
        };
        let path = http_base.path().trim_end_matches('/').to_string();
        http_base.set_path(&path);
        http_base.set_query(None);
        http_base.set_fragment(None);

        let mut ws_base = http_base.clone();
        ws_base
            .set_scheme(ws_scheme)
            .map_err(|_| LinkError::InvalidServer(trimmed.to_string()))?;

        Ok(Endpoints {
            http_base,
            ws_base,
            robot_id: robot_id.to_string(),
        })
    }

    pub fn robot_id(&self) -> &str {
        &self.robot_id
    }

    /// `ws(s)://…/ws/{channel}/client/{robot}`
    pub fn socket_url(&self, channel: ChannelKind) -> LinkResult<Url> {
        join(
            &self.ws_base,
            &["ws", channel.name(), "client", &self.robot_id],
        )
    }

    /// `http(s)://…/mjpeg/[thermal/]{robot}?t={cache_buster}`
    pub fn mjpeg_url(&self, stream: StreamKind, cache_buster: i64) -> LinkResult<Url> {
        let mut url = match stream {
            StreamKind::Video => join(&self.http_base, &["mjpeg", &self.robot_id])?,
            StreamKind::Thermal => join(&self.http_base, &["mjpeg", "thermal", &self.robot_id])?,
        };
        url.query_pairs_mut()
            .append_pair("t", &cache_buster.to_string());
        Ok(url)
    }
}

fn join(base: &Url, segments: &[&str]) -> LinkResult<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| LinkError::InvalidServer(base.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}
