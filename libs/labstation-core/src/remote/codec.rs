//! Wire codec for the remote module channel: length-prefixed
//! frames carrying `serde`-serialized request/response envelopes, with a
//! binary-shaped fast path for dense numeric arrays.

use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Refuses to allocate a frame body larger than this many bytes; guards
/// against a corrupt or hostile length prefix.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// A value crossing the remote boundary. Dense
/// numeric arrays take the `F64Array` fast path; everything else is a plain
/// JSON value. Both are deserialized back to an owned value at the far end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireValue {
    F64Array(Vec<f64>),
    Json(serde_json::Value),
}

impl WireValue {
    #[must_use]
    pub fn into_json(self) -> serde_json::Value {
        match self {
            WireValue::F64Array(a) => serde_json::json!(a),
            WireValue::Json(v) => v,
        }
    }

    /// Takes the fast path automatically whenever `v` is a non-empty array
    /// of plain numbers; any other shape (including mixed/sparse arrays)
    /// falls back to the general JSON encoding.
    #[must_use]
    pub fn from_json(v: serde_json::Value) -> Self {
        if let serde_json::Value::Array(items) = &v {
            if !items.is_empty() {
                let numeric: Option<Vec<f64>> =
                    items.iter().map(serde_json::Value::as_f64).collect();
                if let Some(nums) = numeric {
                    return WireValue::F64Array(nums);
                }
            }
        }
        WireValue::Json(v)
    }
}

/// Client-to-server requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Request {
    ListRemotable,
    Acquire {
        module_name: String,
    },
    Release {
        handle: u64,
    },
    Call {
        handle: u64,
        attr: String,
        args: Vec<WireValue>,
    },
    GetAttr {
        handle: u64,
        attr: String,
    },
    SetAttr {
        handle: u64,
        attr: String,
        value: WireValue,
    },
}

/// Server-to-client responses. Errors carry a class name, message and
/// (informally, folded into `message`) a structured trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum Response {
    Value { value: WireValue },
    Remotable { modules: Vec<String> },
    Acquired { handle: u64, interfaces: Vec<String> },
    Released,
    Error { class: String, message: String },
}

/// Writes one length-prefixed, `serde_json`-encoded frame.
///
/// # Errors
/// Propagates serialization or I/O failures.
pub async fn write_frame<W, T>(w: &mut W, msg: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(msg).map_err(io::Error::other)?;
    let len = u32::try_from(bytes.len()).map_err(io::Error::other)?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(&bytes).await?;
    w.flush().await
}

/// Reads one length-prefixed, `serde_json`-encoded frame.
///
/// # Errors
/// Propagates I/O failures, an oversize length prefix, or a malformed body.
pub async fn read_frame<R, T>(r: &mut R) -> io::Result<T>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::other(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME_BYTES}-byte limit"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf).map_err(io::Error::other)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_numeric_array_takes_fast_path() {
        let v = serde_json::json!([1.0, 2.0, 3.5]);
        let wire = WireValue::from_json(v);
        assert!(matches!(wire, WireValue::F64Array(_)));
    }

    #[test]
    fn mixed_array_falls_back_to_json() {
        let v = serde_json::json!([1.0, "two", 3.0]);
        let wire = WireValue::from_json(v);
        assert!(matches!(wire, WireValue::Json(_)));
    }

    #[tokio::test]
    async fn frame_round_trips_over_an_in_memory_duplex() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let req = Request::Acquire {
            module_name: "hw_a".to_string(),
        };
        write_frame(&mut a, &req).await.expect("write");
        let got: Request = read_frame(&mut b).await.expect("read");
        assert!(matches!(got, Request::Acquire { module_name } if module_name == "hw_a"));
    }
}
