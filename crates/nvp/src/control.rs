//! Control-plane requests.
//!
//! Volume and snapshot management uses a short-lived, single-shot
//! connection with its own context and loop; callers block until the reply
//! arrives or the bound expires.

use futures_util::{SinkExt, StreamExt};
use tokio_util::codec::Framed;

use nvp_msg::{Message, Opcode};
use nvp_transport::{DataBuf, Frame, FrameCodec, KeepaliveConfig, Uri};

use crate::{Error, Result};

const CONTROL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Runs one request/reply exchange on a fresh connection. The reply header
/// is checked for the paired opcode; a negative `retval` surfaces as
/// [`Error::Remote`].
pub(crate) fn control_request(
    uri: &Uri,
    keepalive: &KeepaliveConfig,
    msg: Message,
) -> Result<(Message, Option<DataBuf>)> {
    let expected = msg.opcode.response();
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Transport(e.into()))?;
    rt.block_on(async {
        let exchange = async {
            let stream = nvp_transport::connect(uri, keepalive).await?;
            let mut framed = Framed::new(stream, FrameCodec::new());
            framed.send(Frame::new(msg.encode()?)).await?;
            loop {
                match framed.next().await {
                    Some(Ok(frame)) => {
                        let reply = Message::decode(&frame.header)?;
                        if reply.opcode == Opcode::ShutdownRsp {
                            return Err(Error::NotConnected);
                        }
                        if reply.opcode == Opcode::ErrorRsp
                            || Some(reply.opcode) == expected
                        {
                            if reply.retval < 0 {
                                return Err(Error::Remote(reply.errval));
                            }
                            return Ok((reply, frame.data));
                        }
                        log::debug!(
                            "ignoring out-of-band control reply {}",
                            reply.opcode
                        );
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(Error::NotConnected),
                }
            }
        };
        match tokio::time::timeout(CONTROL_TIMEOUT, exchange).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    })
}

/// Control exchange returning the data iovec unpacked as a name list.
pub(crate) fn control_list(
    uri: &Uri,
    keepalive: &KeepaliveConfig,
    msg: Message,
) -> Result<(Message, Vec<String>)> {
    let (reply, data) = control_request(uri, keepalive, msg)?;
    let names = match data {
        Some(data) => nvp_msg::unpack_names(data.as_slice())?,
        None => Vec::new(),
    };
    Ok((reply, names))
}
