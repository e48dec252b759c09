//! Bootstrap address parsing.

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};

use crate::error::NetworkError;

/// Parse a bootstrap address of the form
/// `/ip4/1.2.3.4/tcp/9000/p2p/<peer-id>` into its peer id and dial address.
pub fn parse_bootstrap_addr(s: &str) -> Result<(PeerId, Multiaddr), NetworkError> {
    let addr: Multiaddr = s
        .parse()
        .map_err(|e| NetworkError::InvalidAddress(format!("{}: {}", s, e)))?;

    let mut dial_addr = Multiaddr::empty();
    let mut peer_id = None;
    for protocol in addr.iter() {
        if let Protocol::P2p(peer) = protocol {
            peer_id = Some(peer);
        } else {
            dial_addr.push(protocol);
        }
    }

    match peer_id {
        Some(peer) => Ok((peer, dial_addr)),
        None => Err(NetworkError::InvalidAddress(format!(
            "{}: missing /p2p/ component",
            s
        ))),
    }
}
