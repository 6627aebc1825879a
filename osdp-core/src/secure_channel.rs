//! OSDP secure channel
//!
//! AES-128 key agreement and per-message protection.
//!
//! # Handshake
//!
//! ```text
//! ACU                                        PD
//!  │── osdp_CHLNG   (server random) ─────────▶│ derive S-ENC, S-MAC1, S-MAC2
//!  │◀───────── osdp_CCRYPT (client random, ───│
//!  │             client cryptogram)           │
//!  │── osdp_SCRYPT  (server cryptogram) ─────▶│ verify, derive initial RMAC
//!  │◀───────── osdp_RMAC_I (initial RMAC) ────│
//! ```
//!
//! After the handshake every frame carries a 4-byte truncated CBC-MAC and,
//! when it has a payload, an AES-128-CBC encrypted payload.

use aes::Aes128;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray};
use tracing::debug;

use crate::error::{Error, FrameError, Result};

/// AES block size
pub const BLOCK_SIZE: usize = 16;

/// Padding marker placed after the data
const PADDING_START: u8 = 0x80;

/// A 128-bit key
pub type Key = [u8; 16];

/// Traffic direction, used to pick the rolling MAC an operation chains from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// ACU to PD
    Command,
    /// PD to ACU
    Reply,
}

/// Session keys derived from the base key and the ACU random
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub enc: Key,
    pub smac1: Key,
    pub smac2: Key,
}

impl SessionKeys {
    /// Derive S-ENC, S-MAC1 and S-MAC2
    ///
    /// Each key is the AES-ECB encryption under `scbk` of
    /// `[0x01, kind, server_random[0..6], 0 × 8]` with kind 0x82, 0x01 and 0x02.
    pub fn derive(scbk: &Key, server_random: &[u8; 8]) -> Self {
        let derive = |kind: u8| {
            let mut block = [0u8; BLOCK_SIZE];
            block[0] = 0x01;
            block[1] = kind;
            block[2..8].copy_from_slice(&server_random[..6]);
            encrypt_block(scbk, &block)
        };

        Self {
            enc: derive(0x82),
            smac1: derive(0x01),
            smac2: derive(0x02),
        }
    }

    /// Cryptogram the PD returns: `E_SENC(server_random || client_random)`
    pub fn client_cryptogram(&self, server_random: &[u8; 8], client_random: &[u8; 8]) -> [u8; 16] {
        encrypt_block(&self.enc, &concat(server_random, client_random))
    }

    /// Cryptogram the ACU returns: `E_SENC(client_random || server_random)`
    pub fn server_cryptogram(&self, client_random: &[u8; 8], server_random: &[u8; 8]) -> [u8; 16] {
        encrypt_block(&self.enc, &concat(client_random, server_random))
    }

    /// Initial reply MAC: `E_SMAC2(E_SMAC1(server_cryptogram))`
    pub fn initial_rmac(&self, server_cryptogram: &[u8; 16]) -> [u8; 16] {
        encrypt_block(&self.smac2, &encrypt_block(&self.smac1, server_cryptogram))
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

/// Secure channel state for one device
///
/// Owned by exactly one session. The ACU drives
/// [`begin`](Self::begin) → [`accept_client_cryptogram`](Self::accept_client_cryptogram)
/// → [`establish`](Self::establish); the PD drives
/// [`respond_to_challenge`](Self::respond_to_challenge) →
/// [`verify_server_cryptogram`](Self::verify_server_cryptogram).
#[derive(Debug, Clone, Default)]
pub struct SecureChannel {
    server_random: [u8; 8],
    client_random: [u8; 8],
    keys: Option<SessionKeys>,
    server_cryptogram: [u8; 16],
    cmac: [u8; 16],
    rmac: [u8; 16],
    is_initialized: bool,
    is_established: bool,
}

impl SecureChannel {
    /// Create a channel with no handshake in progress
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget all key material and rolling state
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Check if the key exchange has produced session keys
    pub fn is_initialized(&self) -> bool {
        self.is_initialized
    }

    /// Check if the cryptogram exchange has completed
    pub fn is_established(&self) -> bool {
        self.is_established
    }

    /// Random chosen by the ACU for the current handshake
    pub fn server_random(&self) -> [u8; 8] {
        self.server_random
    }

    /// Server cryptogram computed once the client cryptogram was accepted
    pub fn server_cryptogram(&self) -> [u8; 16] {
        self.server_cryptogram
    }

    /// Rolling command MAC
    pub fn cmac(&self) -> [u8; 16] {
        self.cmac
    }

    /// Rolling reply MAC
    pub fn rmac(&self) -> [u8; 16] {
        self.rmac
    }

    /// ACU: start a new handshake with a fresh random
    ///
    /// Any established session is torn down first.
    pub fn begin(&mut self, server_random: [u8; 8]) {
        self.reset();
        self.server_random = server_random;
    }

    /// ACU: check the PD's cryptogram and compute the server cryptogram
    ///
    /// Returns `false` and clears the channel when the cryptogram does not
    /// verify. No further detail is reported.
    pub fn accept_client_cryptogram(
        &mut self,
        scbk: &Key,
        client_random: [u8; 8],
        client_cryptogram: &[u8; 16],
    ) -> bool {
        let keys = SessionKeys::derive(scbk, &self.server_random);

        if keys.client_cryptogram(&self.server_random, &client_random) != *client_cryptogram {
            debug!("Client cryptogram did not verify");
            self.reset();
            return false;
        }

        self.server_cryptogram = keys.server_cryptogram(&client_random, &self.server_random);
        self.client_random = client_random;
        self.keys = Some(keys);
        self.is_initialized = true;
        self.is_established = false;
        true
    }

    /// ACU: complete the handshake with the PD's initial RMAC
    pub fn establish(&mut self, initial_rmac: &[u8; 16]) -> bool {
        let Some(keys) = self.keys.as_ref().filter(|_| self.is_initialized) else {
            return false;
        };

        if keys.initial_rmac(&self.server_cryptogram) != *initial_rmac {
            debug!("Initial RMAC did not verify");
            self.reset();
            return false;
        }

        self.rmac = *initial_rmac;
        self.is_established = true;
        true
    }

    /// PD: answer a session challenge, returning the client cryptogram
    ///
    /// A challenge on an established channel is a re-key: the established state
    /// is cleared before anything is derived.
    pub fn respond_to_challenge(
        &mut self,
        scbk: &Key,
        server_random: [u8; 8],
        client_random: [u8; 8],
    ) -> [u8; 16] {
        self.reset();

        let keys = SessionKeys::derive(scbk, &server_random);
        let cryptogram = keys.client_cryptogram(&server_random, &client_random);

        self.server_cryptogram = keys.server_cryptogram(&client_random, &server_random);
        self.server_random = server_random;
        self.client_random = client_random;
        self.keys = Some(keys);
        self.is_initialized = true;

        cryptogram
    }

    /// PD: verify the ACU's cryptogram, returning the initial RMAC on success
    pub fn verify_server_cryptogram(&mut self, cryptogram: &[u8; 16]) -> Option<[u8; 16]> {
        if !self.is_initialized {
            return None;
        }

        if self.server_cryptogram != *cryptogram {
            debug!("Server cryptogram did not verify");
            self.reset();
            return None;
        }

        let rmac = self.keys.as_ref()?.initial_rmac(cryptogram);
        self.rmac = rmac;
        self.is_established = true;
        Some(rmac)
    }

    /// Compute the MAC of an outgoing frame and advance the rolling state
    ///
    /// Commands chain from RMAC and produce the next CMAC; replies chain from
    /// CMAC and produce the next RMAC.
    pub fn generate_mac(&mut self, data: &[u8], direction: Direction) -> Result<[u8; 16]> {
        let keys = self.established_keys()?;
        let mac = cbc_mac(keys, &self.chain_iv(direction), data);
        self.store_mac(mac, direction);
        Ok(mac)
    }

    /// Verify the truncated MAC of an incoming frame
    ///
    /// The rolling state only advances when the MAC matches.
    pub fn verify_mac(&mut self, data: &[u8], received: &[u8], direction: Direction) -> Result<()> {
        let keys = self.established_keys()?;
        let mac = cbc_mac(keys, &self.chain_iv(direction), data);

        if received.is_empty() || received.len() > BLOCK_SIZE || mac[..received.len()] != *received {
            return Err(Error::InvalidMac);
        }

        self.store_mac(mac, direction);
        Ok(())
    }

    /// Pad and encrypt a payload
    ///
    /// The IV is the complement of the other direction's rolling MAC.
    pub fn encrypt(&self, data: &[u8], direction: Direction) -> Result<Vec<u8>> {
        let keys = self.established_keys()?;
        let mut iv = self.crypt_iv(direction);

        let mut out = pad(data);
        for chunk in out.chunks_mut(BLOCK_SIZE) {
            xor_into(chunk, &iv);
            let mut block = [0u8; BLOCK_SIZE];
            block.copy_from_slice(chunk);
            iv = encrypt_block(&keys.enc, &block);
            chunk.copy_from_slice(&iv);
        }

        Ok(out)
    }

    /// Decrypt a payload and strip its padding
    pub fn decrypt(&self, data: &[u8], direction: Direction) -> Result<Vec<u8>> {
        let keys = self.established_keys()?;

        if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
            return Err(FrameError::InvalidPadding.into());
        }

        let mut iv = self.crypt_iv(direction);
        let mut out = Vec::with_capacity(data.len());
        for chunk in data.chunks(BLOCK_SIZE) {
            let mut block = [0u8; BLOCK_SIZE];
            block.copy_from_slice(chunk);
            let mut plain = decrypt_block(&keys.enc, &block);
            xor_into(&mut plain, &iv);
            out.extend_from_slice(&plain);
            iv = block;
        }

        unpad(&mut out)?;
        Ok(out)
    }

    fn established_keys(&self) -> Result<&SessionKeys> {
        match &self.keys {
            Some(keys) if self.is_established => Ok(keys),
            _ => Err(Error::SecureChannelRequired),
        }
    }

    fn chain_iv(&self, direction: Direction) -> [u8; 16] {
        match direction {
            Direction::Command => self.rmac,
            Direction::Reply => self.cmac,
        }
    }

    fn crypt_iv(&self, direction: Direction) -> [u8; 16] {
        self.chain_iv(direction).map(|b| !b)
    }

    fn store_mac(&mut self, mac: [u8; 16], direction: Direction) {
        match direction {
            Direction::Command => self.cmac = mac,
            Direction::Reply => self.rmac = mac,
        }
    }
}

/// CBC-MAC with S-MAC1 on every block but the last, S-MAC2 on the last
///
/// A short final block is padded with 0x80 and zeros; a full final block is
/// not padded.
fn cbc_mac(keys: &SessionKeys, iv: &[u8; 16], data: &[u8]) -> [u8; 16] {
    let block_count = data.len().div_ceil(BLOCK_SIZE).max(1);
    let mut mac = *iv;

    for index in 0..block_count {
        let start = index * BLOCK_SIZE;
        let chunk = &data[start.min(data.len())..(start + BLOCK_SIZE).min(data.len())];

        let mut block = [0u8; BLOCK_SIZE];
        block[..chunk.len()].copy_from_slice(chunk);
        if chunk.len() < BLOCK_SIZE {
            block[chunk.len()] = PADDING_START;
        }
        xor_into(&mut block, &mac);

        let key = if index + 1 == block_count {
            &keys.smac2
        } else {
            &keys.smac1
        };
        mac = encrypt_block(key, &block);
    }

    mac
}

/// Append 0x80 and zero-fill to a block multiple
fn pad(data: &[u8]) -> Vec<u8> {
    let padded_len = (data.len() + 1).div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    let mut out = Vec::with_capacity(padded_len);
    out.extend_from_slice(data);
    out.push(PADDING_START);
    out.resize(padded_len, 0);
    out
}

fn unpad(data: &mut Vec<u8>) -> Result<()> {
    while let Some(&last) = data.last() {
        data.pop();
        match last {
            0x00 => continue,
            PADDING_START => return Ok(()),
            _ => break,
        }
    }
    Err(FrameError::InvalidPadding.into())
}

fn encrypt_block(key: &Key, block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut buf = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut buf);
    let mut out = [0u8; 16];
    out.copy_from_slice(&buf);
    out
}

fn decrypt_block(key: &Key, block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut buf = GenericArray::clone_from_slice(block);
    cipher.decrypt_block(&mut buf);
    let mut out = [0u8; 16];
    out.copy_from_slice(&buf);
    out
}

fn xor_into(target: &mut [u8], other: &[u8; 16]) {
    for (t, o) in target.iter_mut().zip(other.iter()) {
        *t ^= o;
    }
}

fn concat(first: &[u8; 8], second: &[u8; 8]) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[..8].copy_from_slice(first);
    block[8..].copy_from_slice(second);
    block
}
