//! Tuya wire protocol implementation.
//! Framing and deframing of the 55AA (v3.1 - v3.4) and 6699 (v3.5) layouts,
//! CRC/HMAC trailer handling and return-code detection.

use crate::crypto::{GCM_NONCE_LEN, GCM_TAG_LEN, TuyaCipher};
use crate::error::{Result, TuyaError};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use crc::{CRC_32_ISO_HDLC, Crc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

pub const PREFIX_55AA: u32 = 0x0000_55AA;
pub const PREFIX_6699: u32 = 0x0000_6699;
pub const SUFFIX_55AA: u32 = 0x0000_AA55;
pub const SUFFIX_6699: u32 = 0x0000_9966;

const HEADER_LEN_55AA: usize = 16;
const HEADER_LEN_6699: usize = 18;
const HMAC_LEN: usize = 32;
const CRC_LEN: usize = 4;
const SUFFIX_LEN: usize = 4;
const RETCODE_LEN: usize = 4;

/// Frames declaring a larger payload than this are treated as corrupt.
pub const MAX_PAYLOAD_LEN: usize = 1000;

type HmacSha256 = Hmac<Sha256>;

/// Command codes understood by the LAN protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CommandType {
    ApConfig = 1,
    Active = 2,
    SessKeyNegStart = 3,
    SessKeyNegResp = 4,
    SessKeyNegFinish = 5,
    Unbind = 6,
    Control = 7,
    Status = 8,
    HeartBeat = 9,
    DpQuery = 10,
    TokenBind = 12,
    ControlNew = 13,
    DpQueryNew = 16,
    UpdateDps = 18,
    UdpNew = 19,
    BroadcastLpv34 = 35,
    ReqDevInfo = 37,
    LanExtStream = 64,
}

impl CommandType {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => Self::ApConfig,
            2 => Self::Active,
            3 => Self::SessKeyNegStart,
            4 => Self::SessKeyNegResp,
            5 => Self::SessKeyNegFinish,
            6 => Self::Unbind,
            7 => Self::Control,
            8 => Self::Status,
            9 => Self::HeartBeat,
            10 => Self::DpQuery,
            12 => Self::TokenBind,
            13 => Self::ControlNew,
            16 => Self::DpQueryNew,
            18 => Self::UpdateDps,
            19 => Self::UdpNew,
            35 => Self::BroadcastLpv34,
            37 => Self::ReqDevInfo,
            64 => Self::LanExtStream,
            _ => return None,
        })
    }
}

/// Commands whose plaintext never carries the 15-byte version header,
/// even on protocol 3.3 and newer.
const NO_VERSION_HEADER_CMDS: &[u32] = &[
    CommandType::DpQuery as u32,
    CommandType::DpQueryNew as u32,
    CommandType::UpdateDps as u32,
    CommandType::HeartBeat as u32,
    CommandType::SessKeyNegStart as u32,
    CommandType::SessKeyNegResp as u32,
    CommandType::SessKeyNegFinish as u32,
    CommandType::LanExtStream as u32,
];

pub fn needs_version_header(cmd: u32) -> bool {
    !NO_VERSION_HEADER_CMDS.contains(&cmd)
}

/// Protocol generation spoken by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Version {
    V3_1,
    V3_2,
    V3_3,
    V3_4,
    V3_5,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::V3_1 => "3.1",
            Version::V3_2 => "3.2",
            Version::V3_3 => "3.3",
            Version::V3_4 => "3.4",
            Version::V3_5 => "3.5",
        }
    }

    /// The 3-character ASCII form used in version headers.
    pub fn as_bytes(&self) -> &'static [u8] {
        self.as_str().as_bytes()
    }

    /// Whether frames use the 6699 layout (GCM).
    pub fn uses_6699(&self) -> bool {
        *self >= Version::V3_5
    }

    /// Whether 55AA trailers are HMAC-SHA256 and a session key is negotiated.
    pub fn uses_session_key(&self) -> bool {
        *self >= Version::V3_4
    }
}

impl FromStr for Version {
    type Err = TuyaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "3.1" => Ok(Version::V3_1),
            "3.2" => Ok(Version::V3_2),
            "3.3" => Ok(Version::V3_3),
            "3.4" => Ok(Version::V3_4),
            "3.5" => Ok(Version::V3_5),
            other => Err(TuyaError::Configuration(format!(
                "unsupported protocol version '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single protocol frame, before encryption concerns are applied.
#[derive(Debug, Clone)]
pub struct TuyaMessage {
    /// Sequence number
    pub seqno: u32,
    /// Command code
    pub cmd: u32,
    /// Return code; absent on requests and some pushes
    pub retcode: Option<u32>,
    /// Payload bytes (JSON or encrypted binary)
    pub payload: Vec<u8>,
    /// Frame layout tag (PREFIX_55AA or PREFIX_6699)
    pub prefix: u32,
    /// GCM nonce, 6699 frames only
    pub iv: Option<Vec<u8>>,
    /// Whether the CRC/HMAC trailer (or GCM tag) verified
    pub crc_good: bool,
}

impl Default for TuyaMessage {
    fn default() -> Self {
        Self {
            seqno: 0,
            cmd: 0,
            retcode: None,
            payload: Vec::new(),
            prefix: PREFIX_55AA,
            iv: None,
            crc_good: true,
        }
    }
}

/// Parsed frame header.
#[derive(Debug, Clone)]
pub struct TuyaHeader {
    pub prefix: u32,
    pub seqno: u32,
    pub cmd: u32,
    /// Value of the length field (payload plus trailer for 55AA;
    /// nonce plus ciphertext plus tag for 6699)
    pub payload_len: u32,
    /// Total frame length including header and suffix
    pub total_length: u32,
}

impl TuyaHeader {
    pub fn header_len(&self) -> usize {
        if self.prefix == PREFIX_6699 {
            HEADER_LEN_6699
        } else {
            HEADER_LEN_55AA
        }
    }
}

/// Parse a frame header from the start of `data`.
/// Rejects unknown prefixes and lengths beyond the sanity limit.
pub fn parse_header(data: &[u8]) -> Result<TuyaHeader> {
    if data.len() < HEADER_LEN_55AA {
        return Err(TuyaError::Frame("header too short".into()));
    }

    let mut cursor = Cursor::new(data);
    let prefix = cursor.read_u32::<BigEndian>()?;

    let header = match prefix {
        PREFIX_55AA => {
            let seqno = cursor.read_u32::<BigEndian>()?;
            let cmd = cursor.read_u32::<BigEndian>()?;
            let payload_len = cursor.read_u32::<BigEndian>()?;
            let limit = MAX_PAYLOAD_LEN + RETCODE_LEN + HMAC_LEN + SUFFIX_LEN;
            if payload_len as usize > limit {
                return Err(TuyaError::Frame(format!(
                    "declared length {} exceeds sanity limit",
                    payload_len
                )));
            }
            TuyaHeader {
                prefix,
                seqno,
                cmd,
                payload_len,
                total_length: payload_len + HEADER_LEN_55AA as u32,
            }
        }
        PREFIX_6699 => {
            if data.len() < HEADER_LEN_6699 {
                return Err(TuyaError::Frame("6699 header too short".into()));
            }
            let _reserved = cursor.read_u16::<BigEndian>()?;
            let seqno = cursor.read_u32::<BigEndian>()?;
            let cmd = cursor.read_u32::<BigEndian>()?;
            let payload_len = cursor.read_u32::<BigEndian>()?;
            let limit = MAX_PAYLOAD_LEN + RETCODE_LEN + GCM_NONCE_LEN + GCM_TAG_LEN;
            if payload_len as usize > limit {
                return Err(TuyaError::Frame(format!(
                    "declared length {} exceeds sanity limit",
                    payload_len
                )));
            }
            TuyaHeader {
                prefix,
                seqno,
                cmd,
                payload_len,
                total_length: payload_len + (HEADER_LEN_6699 + SUFFIX_LEN) as u32,
            }
        }
        _ => return Err(TuyaError::InvalidHeader),
    };
    Ok(header)
}

/// Pack a message into wire bytes.
/// With an HMAC key the 55AA trailer is HMAC-SHA256, otherwise CRC-32.
/// 6699 frames require the key (it doubles as the GCM key).
pub fn pack_message(msg: &TuyaMessage, hmac_key: Option<&[u8]>) -> Result<Vec<u8>> {
    let mut data = Vec::new();

    if msg.prefix == PREFIX_55AA {
        let retcode_len = if msg.retcode.is_some() { RETCODE_LEN } else { 0 };
        let trailer_len = if hmac_key.is_some() {
            HMAC_LEN + SUFFIX_LEN
        } else {
            CRC_LEN + SUFFIX_LEN
        };
        let payload_len = (msg.payload.len() + retcode_len + trailer_len) as u32;

        data.write_u32::<BigEndian>(msg.prefix)?;
        data.write_u32::<BigEndian>(msg.seqno)?;
        data.write_u32::<BigEndian>(msg.cmd)?;
        data.write_u32::<BigEndian>(payload_len)?;
        if let Some(rc) = msg.retcode {
            data.write_u32::<BigEndian>(rc)?;
        }
        data.extend_from_slice(&msg.payload);

        if let Some(key) = hmac_key {
            let mut mac =
                HmacSha256::new_from_slice(key).map_err(|_| TuyaError::EncryptionFailed)?;
            mac.update(&data);
            data.extend_from_slice(&mac.finalize().into_bytes());
        } else {
            let crc32 = Crc::<u32>::new(&CRC_32_ISO_HDLC);
            data.write_u32::<BigEndian>(crc32.checksum(&data))?;
        }
        data.write_u32::<BigEndian>(SUFFIX_55AA)?;
    } else if msg.prefix == PREFIX_6699 {
        let key = hmac_key.ok_or(TuyaError::EncryptionFailed)?;
        let key: [u8; 16] = key.try_into().map_err(|_| TuyaError::EncryptionFailed)?;

        let mut plain = Vec::new();
        if let Some(rc) = msg.retcode {
            plain.write_u32::<BigEndian>(rc)?;
        }
        plain.extend_from_slice(&msg.payload);

        let payload_len = (GCM_NONCE_LEN + plain.len() + GCM_TAG_LEN) as u32;

        let mut header = Vec::with_capacity(HEADER_LEN_6699);
        header.write_u32::<BigEndian>(PREFIX_6699)?;
        header.write_u16::<BigEndian>(0)?; // reserved
        header.write_u32::<BigEndian>(msg.seqno)?;
        header.write_u32::<BigEndian>(msg.cmd)?;
        header.write_u32::<BigEndian>(payload_len)?;

        // AAD is the header minus the prefix tag.
        let cipher = TuyaCipher::new(&key);
        let sealed = cipher.encrypt_gcm(&plain, msg.iv.as_deref(), Some(&header[4..]))?;

        data.extend_from_slice(&header);
        data.extend_from_slice(&sealed);
        data.write_u32::<BigEndian>(SUFFIX_6699)?;
    } else {
        return Err(TuyaError::InvalidHeader);
    }

    Ok(data)
}

/// Decide whether a 55AA body starts with a 4-byte return code.
/// JSON payloads start with `{`; a `{` four bytes in means a retcode precedes
/// it; anything else is assumed to carry one.
fn body_has_retcode(body: &[u8]) -> bool {
    if body.first() == Some(&b'{') {
        return false;
    }
    if body.len() >= RETCODE_LEN + 1 && body[RETCODE_LEN] == b'{' {
        return true;
    }
    body.len() >= RETCODE_LEN
}

/// Unpack wire bytes into a message.
///
/// A bad CRC/HMAC trailer is reported through `crc_good` on the returned
/// message rather than as an error, so callers can log before closing.
/// `no_retcode` overrides return-code auto-detection when the caller knows.
pub fn unpack_message(
    data: &[u8],
    hmac_key: Option<&[u8]>,
    header: Option<TuyaHeader>,
    no_retcode: Option<bool>,
) -> Result<TuyaMessage> {
    let header = match header {
        Some(h) => h,
        None => parse_header(data)?,
    };

    if data.len() < header.total_length as usize {
        return Err(TuyaError::Frame(format!(
            "have {} bytes of a {}-byte frame",
            data.len(),
            header.total_length
        )));
    }
    let msg_len = header.total_length as usize;

    if header.prefix == PREFIX_55AA {
        let trailer_len = if hmac_key.is_some() {
            HMAC_LEN + SUFFIX_LEN
        } else {
            CRC_LEN + SUFFIX_LEN
        };
        let payload_end = msg_len
            .checked_sub(trailer_len)
            .filter(|&end| end >= HEADER_LEN_55AA)
            .ok_or_else(|| TuyaError::Frame("frame shorter than its trailer".into()))?;

        let body = &data[HEADER_LEN_55AA..payload_end];
        let has_retcode = match no_retcode {
            Some(no) => !no && body.len() >= RETCODE_LEN,
            None => body_has_retcode(body),
        };
        let (retcode, payload) = if has_retcode {
            (
                Some(BigEndian::read_u32(&body[..RETCODE_LEN])),
                body[RETCODE_LEN..].to_vec(),
            )
        } else {
            (None, body.to_vec())
        };

        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(TuyaError::Frame(format!(
                "payload of {} bytes exceeds sanity limit",
                payload.len()
            )));
        }

        let signed = &data[..payload_end];
        let trailer = &data[payload_end..msg_len];
        let crc_good = if let Some(key) = hmac_key {
            let mut mac =
                HmacSha256::new_from_slice(key).map_err(|_| TuyaError::EncryptionFailed)?;
            mac.update(signed);
            mac.verify_slice(&trailer[..HMAC_LEN]).is_ok()
        } else {
            let crc32 = Crc::<u32>::new(&CRC_32_ISO_HDLC);
            crc32.checksum(signed) == BigEndian::read_u32(&trailer[..CRC_LEN])
        };

        Ok(TuyaMessage {
            seqno: header.seqno,
            cmd: header.cmd,
            retcode,
            payload,
            prefix: header.prefix,
            iv: None,
            crc_good,
        })
    } else if header.prefix == PREFIX_6699 {
        let key = hmac_key.ok_or(TuyaError::DecryptionFailed)?;
        let key: [u8; 16] = key.try_into().map_err(|_| TuyaError::DecryptionFailed)?;

        let sealed = &data[HEADER_LEN_6699..msg_len - SUFFIX_LEN];
        if sealed.len() < GCM_NONCE_LEN + GCM_TAG_LEN {
            return Err(TuyaError::InvalidPayload);
        }
        let iv = &sealed[..GCM_NONCE_LEN];

        // Tag mismatch surfaces as a crypto error; there is no payload to hand back.
        let cipher = TuyaCipher::new(&key);
        let mut payload = cipher.decrypt_gcm(
            &sealed[GCM_NONCE_LEN..],
            Some(iv),
            Some(&data[4..HEADER_LEN_6699]),
        )?;

        let mut retcode = None;
        let has_retcode = match no_retcode {
            Some(no) => !no && payload.len() >= RETCODE_LEN,
            None => {
                payload.len() > RETCODE_LEN
                    && payload[0] != b'{'
                    && (payload[RETCODE_LEN] == b'{' || payload[RETCODE_LEN] == b'3')
            }
        };
        if has_retcode {
            retcode = Some(BigEndian::read_u32(&payload[..RETCODE_LEN]));
            payload.drain(..RETCODE_LEN);
        }

        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(TuyaError::Frame(format!(
                "payload of {} bytes exceeds sanity limit",
                payload.len()
            )));
        }

        Ok(TuyaMessage {
            seqno: header.seqno,
            cmd: header.cmd,
            retcode,
            payload,
            prefix: header.prefix,
            iv: Some(iv.to_vec()),
            crc_good: true,
        })
    } else {
        Err(TuyaError::InvalidHeader)
    }
}

/// Pull the next complete frame out of a receive buffer.
///
/// Leading junk before a prefix tag is discarded. Returns `Ok(None)` when the
/// buffer does not yet hold a full frame (caller waits for more bytes), the
/// frame bytes plus parsed header once one is complete, or an error for
/// corrupt headers.
pub fn extract_frame(buf: &mut Vec<u8>) -> Result<Option<(TuyaHeader, Vec<u8>)>> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let start = (0..=buf.len() - 4).find(|&i| {
        let word = BigEndian::read_u32(&buf[i..i + 4]);
        word == PREFIX_55AA || word == PREFIX_6699
    });
    let Some(start) = start else {
        // No prefix in sight; keep the tail that could begin one.
        let keep_from = buf.len() - 3;
        log::debug!("discarding {} junk bytes from receive buffer", keep_from);
        buf.drain(..keep_from);
        return Ok(None);
    };
    if start > 0 {
        log::debug!("resynchronizing: skipped {} bytes before prefix", start);
        buf.drain(..start);
    }

    let prefix = BigEndian::read_u32(&buf[..4]);
    let header_len = if prefix == PREFIX_6699 {
        HEADER_LEN_6699
    } else {
        HEADER_LEN_55AA
    };
    if buf.len() < header_len {
        return Ok(None);
    }

    let header = parse_header(buf)?;
    if buf.len() < header.total_length as usize {
        return Ok(None);
    }

    let frame: Vec<u8> = buf.drain(..header.total_length as usize).collect();
    Ok(Some((header, frame)))
}
