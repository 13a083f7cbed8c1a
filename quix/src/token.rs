// Copyright (C) 2025, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Stateless reset token derivation.

use ring::hmac;

use crate::cid::ConnectionId;

/// The length of a stateless reset token.
pub const RESET_TOKEN_LEN: usize = 16;

/// Derives the stateless reset token for a connection ID.
///
/// The token is the truncated HMAC-SHA256 of the CID under a per-server
/// secret, so it can be recomputed for any CID this server ever issued
/// without keeping per-connection state.
pub fn reset_token(secret: &[u8], cid: &ConnectionId) -> [u8; RESET_TOKEN_LEN] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let tag = hmac::sign(&key, cid);

    let mut token = [0u8; RESET_TOKEN_LEN];
    token.copy_from_slice(&tag.as_ref()[..RESET_TOKEN_LEN]);
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_cids_distinct_tokens() {
        let secret = [0x42; 32];

        let cid1 = ConnectionId::from_ref(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let cid2 = ConnectionId::from_ref(&[1, 2, 3, 4, 5, 6, 7, 9]);

        assert_ne!(reset_token(&secret, &cid1), reset_token(&secret, &cid2));
    }

    #[test]
    fn distinct_secrets_distinct_tokens() {
        let cid = ConnectionId::from_ref(&[1, 2, 3, 4, 5, 6, 7, 8]);

        assert_ne!(reset_token(&[0x42; 32], &cid), reset_token(&[0x43; 32], &cid));
    }

    #[test]
    fn deterministic() {
        let secret = [0x42; 32];
        let cid = ConnectionId::from_ref(&[1, 2, 3, 4, 5, 6, 7, 8]);

        assert_eq!(reset_token(&secret, &cid), reset_token(&secret, &cid));
    }
}
