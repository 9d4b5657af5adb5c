//! Protocol message types
//!
//! Layouts (all integers big-endian):
//!
//! ```text
//! NewAppRequest / Reconnect body:
//!   token_len:u16 token  client_id:u16  app_count:u8
//!   app_count x { port:u16 protocol:u8 host_len:u16 host desc_len:u16 desc }
//!
//! Assignment:
//!   client_id:u16 app_count:u8  app_count x { app_id:u8 port:u16 }
//!
//! Reverse identification frame:
//!   client_id:u16 app_id:u8
//! ```

use crate::codec::FrameReader;
use crate::{AppId, ClientId, ProtoError, MAX_DESCRIPTION_LEN, MAX_HOST_LEN, MAX_TOKEN_LEN};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::AsyncRead;

/// First byte of every control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    NewAppRequest = 0x01,
    Heartbeat = 0x02,
    CloseClient = 0x03,
    Reconnect = 0x04,
}

impl TryFrom<u8> for Opcode {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Opcode::NewAppRequest),
            0x02 => Ok(Opcode::Heartbeat),
            0x03 => Ok(Opcode::CloseClient),
            0x04 => Ok(Opcode::Reconnect),
            other => Err(ProtoError::UnknownOpcode(other)),
        }
    }
}

impl Opcode {
    pub async fn read_from<R>(reader: &mut FrameReader<'_, R>) -> Result<Self, ProtoError>
    where
        R: AsyncRead + Unpin,
    {
        Opcode::try_from(reader.read_u8().await?)
    }
}

/// Protocol spoken on a consumer port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum AppProtocol {
    #[default]
    Tcp = 0x00,
    Http = 0x01,
}

impl TryFrom<u8> for AppProtocol {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(AppProtocol::Tcp),
            0x01 => Ok(AppProtocol::Http),
            other => Err(ProtoError::UnknownProtocol(other)),
        }
    }
}

impl fmt::Display for AppProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppProtocol::Tcp => write!(f, "tcp"),
            AppProtocol::Http => write!(f, "http"),
        }
    }
}

/// Result byte of the reverse-port handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthState {
    Success = 0x01,
    Fail = 0x02,
    Error = 0x03,
}

impl TryFrom<u8> for AuthState {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, ProtoError> {
        match value {
            0x01 => Ok(AuthState::Success),
            0x02 => Ok(AuthState::Fail),
            0x03 => Ok(AuthState::Error),
            other => Err(ProtoError::UnknownAuthState(other)),
        }
    }
}

impl AuthState {
    pub async fn read_from<R>(reader: &mut FrameReader<'_, R>) -> Result<Self, ProtoError>
    where
        R: AsyncRead + Unpin,
    {
        AuthState::try_from(reader.read_u8().await?)
    }
}

/// Encode a length-prefixed token
pub fn encode_token(token: &str) -> Result<Bytes, ProtoError> {
    let mut buf = BytesMut::with_capacity(2 + token.len());
    put_string(&mut buf, "token", token, MAX_TOKEN_LEN)?;
    Ok(buf.freeze())
}

/// Read a length-prefixed token
pub async fn read_token<R>(reader: &mut FrameReader<'_, R>) -> Result<String, ProtoError>
where
    R: AsyncRead + Unpin,
{
    let token = reader.read_string("token", MAX_TOKEN_LEN).await?;
    if !token.is_ascii() {
        return Err(ProtoError::InvalidFrame("token is not ASCII".to_string()));
    }
    Ok(token)
}

fn put_string(
    buf: &mut BytesMut,
    field: &'static str,
    value: &str,
    max: usize,
) -> Result<(), ProtoError> {
    let len = value.len();
    if len > max {
        return Err(ProtoError::FieldTooLong { field, len, max });
    }
    buf.put_u16(len as u16);
    buf.put_slice(value.as_bytes());
    Ok(())
}

/// One requested app slot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRequest {
    /// Preferred consumer port, 0 = let the provider choose
    pub port: u16,
    pub protocol: AppProtocol,
    /// Routing host, empty = wildcard
    pub host: String,
    pub description: String,
}

/// Body of a NewAppRequest or Reconnect control exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAppRequest {
    pub token: String,
    /// Identity hint, 0 when the client has none
    pub client_id: ClientId,
    pub apps: Vec<AppRequest>,
}

impl NewAppRequest {
    /// Encode the body (the opcode byte is written separately)
    pub fn encode(&self) -> Result<Bytes, ProtoError> {
        if self.apps.is_empty() || self.apps.len() > u8::MAX as usize {
            return Err(ProtoError::InvalidFrame(format!(
                "app count must be between 1 and 255, got {}",
                self.apps.len()
            )));
        }

        let mut buf = BytesMut::new();
        put_string(&mut buf, "token", &self.token, MAX_TOKEN_LEN)?;
        buf.put_u16(self.client_id.0);
        buf.put_u8(self.apps.len() as u8);
        for app in &self.apps {
            buf.put_u16(app.port);
            buf.put_u8(app.protocol as u8);
            put_string(&mut buf, "host", &app.host, MAX_HOST_LEN)?;
            put_string(&mut buf, "description", &app.description, MAX_DESCRIPTION_LEN)?;
        }
        Ok(buf.freeze())
    }

    pub async fn read_from<R>(reader: &mut FrameReader<'_, R>) -> Result<Self, ProtoError>
    where
        R: AsyncRead + Unpin,
    {
        let token = read_token(reader).await?;
        let client_id = ClientId(reader.read_u16().await?);
        let count = reader.read_u8().await? as usize;
        if count == 0 {
            return Err(ProtoError::InvalidFrame("app count is zero".to_string()));
        }

        let mut apps = Vec::with_capacity(count);
        for _ in 0..count {
            let port = reader.read_u16().await?;
            let protocol = AppProtocol::try_from(reader.read_u8().await?)?;
            let host = reader.read_string("host", MAX_HOST_LEN).await?;
            let description = reader
                .read_string("description", MAX_DESCRIPTION_LEN)
                .await?;
            apps.push(AppRequest {
                port,
                protocol,
                host,
                description,
            });
        }

        Ok(Self {
            token,
            client_id,
            apps,
        })
    }
}

/// One allocated app slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppAssignment {
    pub app_id: AppId,
    pub port: u16,
}

/// The provider's answer to a NewAppRequest or Reconnect
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub client_id: ClientId,
    pub apps: Vec<AppAssignment>,
}

impl Assignment {
    /// Answer sent for a rejected request
    pub fn rejected() -> Self {
        Self::default()
    }

    pub fn is_rejected(&self) -> bool {
        self.client_id.is_unassigned()
    }

    pub fn encode(&self) -> Result<Bytes, ProtoError> {
        if self.apps.len() > u8::MAX as usize {
            return Err(ProtoError::InvalidFrame(format!(
                "too many apps in assignment: {}",
                self.apps.len()
            )));
        }

        let mut buf = BytesMut::with_capacity(3 + self.apps.len() * 3);
        buf.put_u16(self.client_id.0);
        buf.put_u8(self.apps.len() as u8);
        for app in &self.apps {
            buf.put_u8(app.app_id.0);
            buf.put_u16(app.port);
        }
        Ok(buf.freeze())
    }

    pub async fn read_from<R>(reader: &mut FrameReader<'_, R>) -> Result<Self, ProtoError>
    where
        R: AsyncRead + Unpin,
    {
        let client_id = ClientId(reader.read_u16().await?);
        let count = reader.read_u8().await? as usize;
        let mut apps = Vec::with_capacity(count);
        for _ in 0..count {
            let app_id = AppId(reader.read_u8().await?);
            let port = reader.read_u16().await?;
            apps.push(AppAssignment { app_id, port });
        }
        Ok(Self { client_id, apps })
    }
}

/// Identification frame sent on a fresh reverse connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientIdAppId {
    pub client_id: ClientId,
    pub app_id: AppId,
}

impl ClientIdAppId {
    pub const LEN: usize = 3;

    pub fn new(client_id: ClientId, app_id: AppId) -> Self {
        Self { client_id, app_id }
    }

    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let id = self.client_id.to_be_bytes();
        [id[0], id[1], self.app_id.0]
    }

    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self {
            client_id: ClientId::from_be_bytes([bytes[0], bytes[1]]),
            app_id: AppId(bytes[2]),
        }
    }

    pub async fn read_from<R>(reader: &mut FrameReader<'_, R>) -> Result<Self, ProtoError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; Self::LEN];
        reader.read_exact(&mut buf).await?;
        Ok(Self::from_bytes(buf))
    }
}

impl fmt::Display for ClientIdAppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.client_id, self.app_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn reader_timeout() -> Duration {
        Duration::from_secs(1)
    }

    #[test]
    fn test_opcode_values() {
        assert_eq!(Opcode::try_from(0x01).unwrap(), Opcode::NewAppRequest);
        assert_eq!(Opcode::try_from(0x04).unwrap(), Opcode::Reconnect);
        assert!(matches!(
            Opcode::try_from(0x7f),
            Err(ProtoError::UnknownOpcode(0x7f))
        ));
    }

    #[tokio::test]
    async fn test_new_app_request_layout() {
        let request = NewAppRequest {
            token: "tk".to_string(),
            client_id: ClientId(0x0102),
            apps: vec![AppRequest {
                port: 8080,
                protocol: AppProtocol::Http,
                host: "a.io".to_string(),
                description: "web".to_string(),
            }],
        };
        let bytes = request.encode().unwrap();
        assert_eq!(
            &bytes[..],
            &[
                0x00, 0x02, b't', b'k', // token
                0x01, 0x02, // client id
                0x01, // count
                0x1f, 0x90, // port
                0x01, // http
                0x00, 0x04, b'a', b'.', b'i', b'o', // host
                0x00, 0x03, b'w', b'e', b'b', // description
            ]
        );

        let mut data = &bytes[..];
        let mut reader = FrameReader::new(&mut data, reader_timeout());
        let decoded = NewAppRequest::read_from(&mut reader).await.unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_new_app_request_rejects_empty_app_list() {
        let request = NewAppRequest {
            token: "tk".to_string(),
            client_id: ClientId::UNASSIGNED,
            apps: Vec::new(),
        };
        assert!(matches!(request.encode(), Err(ProtoError::InvalidFrame(_))));
    }

    #[test]
    fn test_description_too_long() {
        let request = NewAppRequest {
            token: "tk".to_string(),
            client_id: ClientId::UNASSIGNED,
            apps: vec![AppRequest {
                description: "x".repeat(MAX_DESCRIPTION_LEN + 1),
                ..Default::default()
            }],
        };
        assert!(matches!(
            request.encode(),
            Err(ProtoError::FieldTooLong {
                field: "description",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_assignment_round_trip() {
        let assignment = Assignment {
            client_id: ClientId(51234),
            apps: vec![
                AppAssignment {
                    app_id: AppId(1),
                    port: 20000,
                },
                AppAssignment {
                    app_id: AppId(2),
                    port: 20001,
                },
            ],
        };
        let bytes = assignment.encode().unwrap();
        assert_eq!(bytes.len(), 3 + 2 * 3);

        let mut data = &bytes[..];
        let mut reader = FrameReader::new(&mut data, reader_timeout());
        let decoded = Assignment::read_from(&mut reader).await.unwrap();
        assert_eq!(decoded, assignment);
        assert!(!decoded.is_rejected());
    }

    #[tokio::test]
    async fn test_rejected_assignment() {
        let bytes = Assignment::rejected().encode().unwrap();
        assert_eq!(&bytes[..], &[0, 0, 0]);

        let mut data = &bytes[..];
        let mut reader = FrameReader::new(&mut data, reader_timeout());
        assert!(Assignment::read_from(&mut reader)
            .await
            .unwrap()
            .is_rejected());
    }

    #[tokio::test]
    async fn test_truncated_assignment_is_short_read() {
        let mut data: &[u8] = &[0x00, 0x07, 0x02, 0x01, 0x4e];
        let mut reader = FrameReader::new(&mut data, reader_timeout());
        let err = Assignment::read_from(&mut reader).await.unwrap_err();
        assert!(matches!(err, ProtoError::ShortRead { .. }));
    }

    #[test]
    fn test_client_id_app_id_frame() {
        let frame = ClientIdAppId::new(ClientId(0xabcd), AppId(9));
        assert_eq!(frame.to_bytes(), [0xab, 0xcd, 0x09]);
        assert_eq!(ClientIdAppId::from_bytes(frame.to_bytes()), frame);
        assert_eq!(frame.to_string(), "43981-9");
    }

    #[tokio::test]
    async fn test_token_must_be_ascii() {
        let bytes = encode_token("héllo").unwrap();
        let mut data = &bytes[..];
        let mut reader = FrameReader::new(&mut data, reader_timeout());
        assert!(matches!(
            read_token(&mut reader).await,
            Err(ProtoError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_protocol_serde() {
        let p: AppProtocol = serde_json::from_str("\"http\"").unwrap();
        assert_eq!(p, AppProtocol::Http);
        assert_eq!(AppProtocol::default(), AppProtocol::Tcp);
    }
}
