//! AVTransport:1, RenderingControl:1, ConnectionManager:1 SOAP action dispatch (server
//! role). Response envelope construction and XML escaping are grounded on
//! `sinks/dlna/avtransport.rs`'s client-side `send_soap_action`/`escape_xml` helpers,
//! inverted here into axum handlers that parse inbound bodies with `quick-xml` (the same
//! crate `sinks/dlna/xml_parser.rs` already depends on) instead of introducing a second
//! XML library.

use super::DlnaState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use bridge_core::{BridgeError, Command, TrackMetadata, TransportState};
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, warn};

pub fn router() -> Router<DlnaState> {
    Router::new()
        .route("/dlna/:device_id/avtransport/control", post(avtransport_control))
        .route("/dlna/:device_id/renderingcontrol/control", post(renderingcontrol_control))
        .route("/dlna/:device_id/connectionmanager/control", post(connectionmanager_control))
}

async fn avtransport_control(
    State(state): State<DlnaState>,
    Path(device_id): Path<String>,
    headers: axum::http::HeaderMap,
    body: String,
) -> Response {
    let Some(action) = soap_action_name(&headers) else {
        return soap_fault(StatusCode::BAD_REQUEST, "missing SOAPAction header");
    };

    match action.as_str() {
        "SetAVTransportURI" => {
            let uri = extract_xml_value(&body, "CurrentURI").unwrap_or_default();
            let metadata_xml = extract_xml_value(&body, "CurrentURIMetaData").unwrap_or_default();
            state.bus.publish_command(Command::SetUri {
                device_id,
                uri,
                metadata: parse_didl_metadata(&metadata_xml),
            });
            soap_ok("SetAVTransportURIResponse", "AVTransport", &[])
        }
        "Play" => {
            state.bus.publish_command(Command::Play { device_id, uri: None, position_s: None });
            soap_ok("PlayResponse", "AVTransport", &[])
        }
        "Pause" => {
            state.bus.publish_command(Command::Pause { device_id });
            soap_ok("PauseResponse", "AVTransport", &[])
        }
        "Stop" => {
            state.bus.publish_command(Command::Stop { device_id });
            soap_ok("StopResponse", "AVTransport", &[])
        }
        "Seek" => {
            let target = extract_xml_value(&body, "Target").unwrap_or_default();
            match parse_rel_time(&target) {
                Some(position_s) => {
                    state.bus.publish_command(Command::Seek { device_id, position_s });
                    soap_ok("SeekResponse", "AVTransport", &[])
                }
                None => soap_fault(StatusCode::BAD_REQUEST, "unparseable Seek Target"),
            }
        }
        "GetTransportInfo" => match state.snapshots.get(&device_id).await {
            Some(snapshot) => soap_ok(
                "GetTransportInfoResponse",
                "AVTransport",
                &[
                    ("CurrentTransportState", transport_state_name(snapshot.transport_state)),
                    ("CurrentTransportStatus", "OK"),
                    ("CurrentSpeed", "1"),
                ],
            ),
            None => unknown_device_fault(&device_id),
        },
        "GetPositionInfo" => match state.snapshots.get(&device_id).await {
            Some(snapshot) => soap_ok(
                "GetPositionInfoResponse",
                "AVTransport",
                &[
                    ("Track", "1"),
                    ("TrackDuration", &seconds_to_rel_time(snapshot.duration_s)),
                    ("RelTime", &seconds_to_rel_time(snapshot.elapsed_s)),
                    ("AbsTime", &seconds_to_rel_time(snapshot.elapsed_s)),
                    ("TrackURI", snapshot.uri.as_deref().unwrap_or("")),
                ],
            ),
            None => unknown_device_fault(&device_id),
        },
        "GetMediaInfo" => match state.snapshots.get(&device_id).await {
            Some(snapshot) => soap_ok(
                "GetMediaInfoResponse",
                "AVTransport",
                &[
                    ("NrTracks", "1"),
                    ("MediaDuration", &seconds_to_rel_time(snapshot.duration_s)),
                    ("CurrentURI", snapshot.uri.as_deref().unwrap_or("")),
                ],
            ),
            None => unknown_device_fault(&device_id),
        },
        other => {
            warn!(action = %other, "unhandled AVTransport SOAP action");
            soap_fault(StatusCode::NOT_IMPLEMENTED, "unhandled action")
        }
    }
}

async fn renderingcontrol_control(
    State(state): State<DlnaState>,
    Path(device_id): Path<String>,
    headers: axum::http::HeaderMap,
    body: String,
) -> Response {
    let Some(action) = soap_action_name(&headers) else {
        return soap_fault(StatusCode::BAD_REQUEST, "missing SOAPAction header");
    };

    match action.as_str() {
        "SetVolume" => match extract_xml_value(&body, "DesiredVolume").and_then(|v| v.parse::<u8>().ok()) {
            Some(volume) => {
                state.bus.publish_command(Command::SetVolume { device_id, volume: volume.min(100) });
                soap_ok("SetVolumeResponse", "RenderingControl", &[])
            }
            None => soap_fault(StatusCode::BAD_REQUEST, "missing or invalid DesiredVolume"),
        },
        "GetVolume" => match state.snapshots.get(&device_id).await {
            Some(snapshot) => soap_ok(
                "GetVolumeResponse",
                "RenderingControl",
                &[("CurrentVolume", &snapshot.volume.to_string())],
            ),
            None => unknown_device_fault(&device_id),
        },
        "SetMute" => {
            let muted = extract_xml_value(&body, "DesiredMute").map(|v| v == "1" || v == "true").unwrap_or(false);
            state.bus.publish_command(Command::SetMute { device_id, muted });
            soap_ok("SetMuteResponse", "RenderingControl", &[])
        }
        "GetMute" => match state.snapshots.get(&device_id).await {
            Some(snapshot) => soap_ok(
                "GetMuteResponse",
                "RenderingControl",
                &[("CurrentMute", if snapshot.muted { "1" } else { "0" })],
            ),
            None => unknown_device_fault(&device_id),
        },
        other => {
            warn!(action = %other, "unhandled RenderingControl SOAP action");
            soap_fault(StatusCode::NOT_IMPLEMENTED, "unhandled action")
        }
    }
}

/// ConnectionManager is queried by controllers during connection setup but carries no
/// state this crate's Virtual Devices care about; a fixed single-stream-protocol-info
/// response is enough to satisfy the handshake.
async fn connectionmanager_control(
    State(_state): State<DlnaState>,
    Path(_device_id): Path<String>,
    headers: axum::http::HeaderMap,
    _body: String,
) -> Response {
    match soap_action_name(&headers).as_deref() {
        Some("GetProtocolInfo") => soap_ok(
            "GetProtocolInfoResponse",
            "ConnectionManager",
            &[("Source", ""), ("Sink", "http-get:*:audio/*:*")],
        ),
        Some("GetCurrentConnectionIDs") => {
            soap_ok("GetCurrentConnectionIDsResponse", "ConnectionManager", &[("ConnectionIDs", "0")])
        }
        _ => soap_fault(StatusCode::NOT_IMPLEMENTED, "unhandled action"),
    }
}

fn soap_action_name(headers: &axum::http::HeaderMap) -> Option<String> {
    let raw = headers.get("SOAPAction")?.to_str().ok()?;
    // `"urn:schemas-upnp-org:service:AVTransport:1#Play"` -> `Play`.
    raw.rsplit('#').next().map(|s| s.trim_matches('"').to_string())
}

fn soap_ok(action_response_tag: &str, service: &str, fields: &[(&str, &str)]) -> Response {
    let service_type = format!("urn:schemas-upnp-org:service:{service}:1");
    let body_fields: String =
        fields.iter().map(|(k, v)| format!("<{k}>{}</{k}>", escape_xml(v))).collect();

    let envelope = format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"
            s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
  <s:Body>
    <u:{action_response_tag} xmlns:u="{service_type}">
      {body_fields}
    </u:{action_response_tag}>
  </s:Body>
</s:Envelope>"#
    );

    (StatusCode::OK, [("Content-Type", "text/xml; charset=utf-8")], envelope).into_response()
}

fn soap_fault(status: StatusCode, message: &str) -> Response {
    debug!(message, "SOAP action rejected");
    let envelope = format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"
            s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
  <s:Body>
    <s:Fault>
      <faultcode>s:Client</faultcode>
      <faultstring>UPnPError</faultstring>
      <detail>{}</detail>
    </s:Fault>
  </s:Body>
</s:Envelope>"#,
        escape_xml(message)
    );
    (status, [("Content-Type", "text/xml; charset=utf-8")], envelope).into_response()
}

/// A device-not-found SOAP fault carrying the same HTTP status and UPnP fault code the
/// synchronous device-manager query path would see if it surfaced `BridgeError` directly.
fn unknown_device_fault(device_id: &str) -> Response {
    let error = BridgeError::DeviceNotFound(device_id.to_string());
    let (status, _code) = error_to_fault(&error);
    soap_fault(status, &error.to_string())
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Pulls the first `<tag>...</tag>` text value out of a SOAP body. The inbound bodies
/// this dispatch needs to read from are always flat (no nested same-named tags), so a
/// streaming `quick-xml` reader is used rather than a DOM, matching `xml_parser.rs`'s
/// own event-loop shape.
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut capturing = false;
    let mut value = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == tag.as_bytes() => capturing = true,
            Ok(Event::Text(e)) if capturing => {
                value.push_str(&e.unescape().unwrap_or_default());
            }
            Ok(Event::End(e)) if e.name().as_ref() == tag.as_bytes() => {
                if capturing {
                    return Some(value);
                }
            }
            Ok(Event::Eof) => return None,
            Err(_) => return None,
            _ => {}
        }
    }
}

/// DIDL-Lite metadata carries only what §4.1's `TrackMetadata` needs; a missing or
/// unparseable blob yields an empty metadata rather than rejecting the command.
fn parse_didl_metadata(didl: &str) -> TrackMetadata {
    TrackMetadata {
        title: extract_xml_value(didl, "dc:title").or_else(|| extract_xml_value(didl, "title")),
        artist: extract_xml_value(didl, "upnp:artist").or_else(|| extract_xml_value(didl, "artist")),
        album: extract_xml_value(didl, "upnp:album").or_else(|| extract_xml_value(didl, "album")),
        cover_url: extract_xml_value(didl, "upnp:albumArtURI"),
    }
}

pub(super) fn transport_state_name(state: TransportState) -> &'static str {
    match state {
        TransportState::NoMediaPresent => "NO_MEDIA_PRESENT",
        TransportState::Stopped => "STOPPED",
        TransportState::Playing => "PLAYING",
        TransportState::PausedPlayback => "PAUSED_PLAYBACK",
        TransportState::Transitioning => "TRANSITIONING",
    }
}

fn seconds_to_rel_time(total_s: f64) -> String {
    let total = total_s.max(0.0).round() as u64;
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

/// Parses `REL_TIME` targets of the form `H:MM:SS` or `H:MM:SS.mmm` into seconds.
fn parse_rel_time(target: &str) -> Option<f64> {
    let mut parts = target.trim().splitn(3, ':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Maps an application error to the UPnP fault code/HTTP status pair it carries.
fn error_to_fault(error: &BridgeError) -> (StatusCode, u32) {
    (
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        error.soap_fault_code(),
    )
}
