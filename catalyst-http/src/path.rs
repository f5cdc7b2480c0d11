//! Playback URL shape parsing (SPEC_FULL.md 4.G). Modeled as an ordered
//! list of `(regex, builder)` tried in sequence, per the design note in
//! SPEC_FULL.md 9 on dynamic dispatch over path shapes.

use regex::Regex;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathType {
    Hls,
    Json,
    Webrtc,
    Flv,
}

impl PathType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            PathType::Hls => "hls",
            PathType::Json => "json",
            PathType::Webrtc => "webrtc",
            PathType::Flv => "flv",
        }
    }
}

/// A successfully parsed playback URL path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPath {
    pub path_type: PathType,
    /// The prefix embedded in the path itself (e.g. `video` in
    /// `video+abc`), distinct from the redirect prefix list in config.
    /// Empty when the path carried no explicit prefix.
    pub prefix: String,
    pub playback_id: String,
    /// Everything that must be preserved verbatim when rewriting the path
    /// for the chosen node (e.g. the `/index.m3u8` suffix for hls).
    pub suffix: String,
}

impl ParsedPath {
    /// Rebuild the path for `full_playback_id` (already `prefix+id`
    /// combined, as produced by the selector), preserving this path's type
    /// and suffix.
    #[must_use]
    pub fn build_path(&self, full_playback_id: &str) -> String {
        build_path(self.path_type, full_playback_id, &self.suffix)
    }
}

fn build_path(path_type: PathType, playback_id: &str, suffix: &str) -> String {
    match path_type {
        PathType::Hls => format!("/hls/{playback_id}/{suffix}"),
        PathType::Json => format!("/json_{playback_id}.js"),
        PathType::Webrtc => format!("/webrtc/{playback_id}"),
        // The flv template omits the /flv/ segment on the target node by
        // design (SPEC_FULL.md 4.G table): `/%s.flv`, not `/flv/%s.flv`.
        PathType::Flv => format!("/{playback_id}.flv"),
    }
}

struct Matcher {
    path_type: PathType,
    regex: &'static Regex,
}

static HLS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/hls/(?:(?P<prefix>[A-Za-z0-9_-]+)\+)?(?P<id>[^/]+)/(?P<suffix>.+)$").unwrap());
static JSON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/json_(?:(?P<prefix>[A-Za-z0-9_-]+)\+)?(?P<id>[^.]+)\.js$").unwrap());
static WEBRTC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/webrtc/(?:(?P<prefix>[A-Za-z0-9_-]+)\+)?(?P<id>[^/]+)$").unwrap());
static FLV_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/flv/(?:(?P<prefix>[A-Za-z0-9_-]+)\+)?(?P<id>[^/]+)$").unwrap());

fn matchers() -> [Matcher; 4] {
    [
        Matcher {
            path_type: PathType::Hls,
            regex: &HLS_RE,
        },
        Matcher {
            path_type: PathType::Json,
            regex: &JSON_RE,
        },
        Matcher {
            path_type: PathType::Webrtc,
            regex: &WEBRTC_RE,
        },
        Matcher {
            path_type: PathType::Flv,
            regex: &FLV_RE,
        },
    ]
}

/// Try each known shape in order; `None` means the path is unrecognized
/// (the redirect handler responds `404`).
#[must_use]
pub fn parse_path(path: &str) -> Option<ParsedPath> {
    for matcher in matchers() {
        if let Some(caps) = matcher.regex.captures(path) {
            let prefix = caps.name("prefix").map_or(String::new(), |m| m.as_str().to_string());
            let playback_id = caps.name("id").map(|m| m.as_str().to_string())?;
            let suffix = caps.name("suffix").map_or(String::new(), |m| m.as_str().to_string());
            return Some(ParsedPath {
                path_type: matcher.path_type,
                prefix,
                playback_id,
                suffix,
            });
        }
    }
    None
}
