//! # Device Pairing
//!
//! Bootstrap for unregistered credentials. When a client authenticates
//! without a bound identity, the server offers pairing references; each is
//! rendered as a QR payload of four comma-joined parts:
//!
//! ```text
//! ref , b64(noise public) , b64(identity public) , adv secret
//! ```
//!
//! Once the primary device scans one, the server sends `pair-success`
//! carrying a signed device identity. The client verifies the HMAC with
//! the advertising secret and the account signature with the embedded
//! account key, counter-signs the binding, and replies. The server then
//! drops the connection with stream error 515, which is the *success*
//! path: the caller reconnects with the now-registered credentials.

use crate::auth::{Account, BoundIdentity};
use crate::config::SERVER_JID;
use crate::core::node::Node;
use crate::error::DisconnectReason;
use crate::protocol::wire;
use crate::service::lifecycle::{ClientInner, ConnectionState, ConnectionUpdate};
use crate::utils::crypto::hmac_sha256;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

/// Signature domain tag for the account's binding signature.
const ACCOUNT_SIGNATURE_TAG: [u8; 2] = [6, 0];
/// Signature domain tag for the device's counter-signature.
const DEVICE_SIGNATURE_TAG: [u8; 2] = [6, 1];

/// Stream error code the server uses for the post-pairing restart.
const RESTART_CODE: &str = "515";

/// Server offered pairing references; publish the first as a QR payload
/// and acknowledge the offer.
pub(crate) async fn handle_pair_device(inner: &Arc<ClientInner>, node: &Node) {
    let Some(pair) = node.child("pair-device") else {
        return;
    };
    let reference = pair
        .child_nodes()
        .iter()
        .filter(|child| child.tag == "ref")
        .find_map(|child| child.text_content());
    let Some(reference) = reference else {
        warn!("pair-device offer carried no refs");
        return;
    };

    let payload = {
        let creds = inner.creds.lock().unwrap_or_else(|e| e.into_inner());
        [
            reference.as_str(),
            &BASE64.encode(creds.noise_key.public_bytes()),
            &BASE64.encode(creds.identity_public()),
            &creds.adv_secret_key,
        ]
        .join(",")
    };
    debug!("publishing pairing reference");
    inner.publish(ConnectionUpdate {
        state: ConnectionState::Authenticating,
        reason: None,
        pairing_ref: Some(payload),
        is_new_login: false,
    });

    let ack = Node::new("iq")
        .attr("to", SERVER_JID)
        .attr("type", "result")
        .attr("id", node.id().unwrap_or_default());
    if let Err(e) = inner.transport.send_node(&ack).await {
        debug!(error = %e, "pair-device ack failed");
    }
}

/// The primary device accepted: verify and counter-sign the device
/// identity, bind it into the credentials, and reply.
///
/// After the reply the next inbound node decides the outcome, so the
/// restart flag is raised before sending.
pub(crate) async fn handle_pair_success(inner: &Arc<ClientInner>, node: &Node) {
    let reply = match configure_identity(inner, node) {
        Ok(reply) => reply,
        Err(msg) => {
            warn!(error = %msg, "pair-success rejected");
            inner.end(DisconnectReason::Pairing(msg));
            return;
        }
    };
    inner.pairing_restart.store(true, Ordering::Release);
    if let Err(e) = inner.transport.send_node(&reply).await {
        inner.pairing_restart.store(false, Ordering::Release);
        unbind_identity(inner);
        inner.end(DisconnectReason::from(&e));
    }
}

/// Drop an identity bound by a pairing attempt the server never confirmed,
/// so callers cannot persist half-registered credentials.
fn unbind_identity(inner: &Arc<ClientInner>) {
    let mut creds = inner.creds.lock().unwrap_or_else(|e| e.into_inner());
    creds.me = None;
    creds.account = None;
}

/// Validate the signed device identity and rewrite the credentials.
///
/// Returns the confirmation node to send back.
fn configure_identity(inner: &Arc<ClientInner>, node: &Node) -> Result<Node, String> {
    let pair = node
        .child("pair-success")
        .ok_or_else(|| "missing pair-success".to_string())?;
    let jid = pair
        .child("device")
        .and_then(|device| device.get_attr("jid"))
        .ok_or_else(|| "missing device jid".to_string())?
        .to_string();
    let name = pair
        .child("biz")
        .and_then(|biz| biz.get_attr("name"))
        .unwrap_or_default()
        .to_string();
    let identity_bytes = pair
        .child("device-identity")
        .and_then(|child| child.bytes_content())
        .ok_or_else(|| "missing device-identity".to_string())?;

    let mut creds = inner.creds.lock().unwrap_or_else(|e| e.into_inner());

    let wrapper =
        wire::decode_identity_hmac(identity_bytes).map_err(|e| format!("bad identity: {e}"))?;
    let expected = hmac_sha256(&creds.adv_secret_bytes(), &wrapper.details);
    if expected.as_slice() != wrapper.hmac.as_slice() {
        return Err("device identity HMAC mismatch".into());
    }

    let mut signed =
        wire::decode_signed_identity(&wrapper.details).map_err(|e| format!("bad identity: {e}"))?;
    let identity_public = creds.identity_public();

    let mut account_message = ACCOUNT_SIGNATURE_TAG.to_vec();
    account_message.extend_from_slice(&signed.details);
    account_message.extend_from_slice(&identity_public);
    if !crate::auth::verify_signature(
        &signed.account_signature_key,
        &account_message,
        &signed.account_signature,
    ) {
        return Err("account signature verification failed".into());
    }

    let mut device_message = DEVICE_SIGNATURE_TAG.to_vec();
    device_message.extend_from_slice(&signed.details);
    device_message.extend_from_slice(&identity_public);
    device_message.extend_from_slice(&signed.account_signature_key);
    signed.device_signature = creds.sign(&device_message).to_vec();

    let details = wire::decode_device_identity(&signed.details)
        .map_err(|e| format!("bad identity details: {e}"))?;

    debug!(%jid, key_index = details.key_index, "identity bound");
    creds.me = Some(BoundIdentity { jid, name });
    creds.account = Some(Account {
        details: signed.details.clone(),
        account_signature_key: signed.account_signature_key.clone(),
        account_signature: signed.account_signature.clone(),
        device_signature: signed.device_signature.clone(),
    });

    // The reply echoes the signed identity without the account key.
    let reply_identity = wire::SignedDeviceIdentity {
        account_signature_key: Vec::new(),
        ..signed
    };
    Ok(Node::new("iq")
        .attr("to", SERVER_JID)
        .attr("type", "result")
        .attr("id", node.id().unwrap_or_default())
        .children(vec![Node::new("pair-device-sign").children(vec![
            Node::new("device-identity")
                .attr("key-index", details.key_index.to_string())
                .bytes(wire::encode_signed_identity(&reply_identity)),
        ])]))
}

/// First node after a pairing reply: stream error 515 means the
/// registration stuck and the caller should reconnect; anything else is a
/// pairing failure.
pub(crate) fn finish_restart(inner: &Arc<ClientInner>, node: &Node) {
    if node.tag == "stream:error" && node.get_attr("code") != Some(RESTART_CODE) {
        let code = node.get_attr("code").unwrap_or("unknown");
        unbind_identity(inner);
        inner.end(DisconnectReason::Pairing(format!(
            "registration rejected with stream error {code}"
        )));
        return;
    }
    debug!("pairing confirmed, restart required");
    inner.publish(ConnectionUpdate {
        state: ConnectionState::Authenticating,
        reason: None,
        pairing_ref: None,
        is_new_login: true,
    });
    inner.end(DisconnectReason::RestartRequired);
}
