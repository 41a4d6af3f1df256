//! Peer identity: per-player signing keys, challenges and signatures.
//!
//! Every local player owns an ed25519 key. A joining client proves possession
//! of its keys by signing the server's join challenge, signs every ticcmd
//! bundle and chat line it sends, and once per round signs a shared
//! challenge whose results every client verifies for every other player.
//!
//! A challenge is 64 bytes:
//!
//! ```text
//! ┌────────────────┬──────────────┬─────────────────────────────┐
//! │ unix time (LE) │ server IPv4  │ random                      │
//! │ 8 bytes        │ 4 bytes (BE) │ 52 bytes                    │
//! └────────────────┴──────────────┴─────────────────────────────┘
//! ```
//!
//! The embedded time and address let a signer refuse challenges that are
//! replayed later or relayed from another server.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::net::Ipv4Addr;

use crate::network::messages::{Challenge, PublicKeyBytes, SignatureBytes};
use crate::{PlayerSlot, Tic, MAXPLAYERNAME, MAXPLAYERS, MAXSPLITSCREENPLAYERS, TICRATE};

/// Round re-proof: tics after the round start at which responders are checked.
pub const CHALLENGEALL_KICKUNRESPONSIVE: u32 = 5 * TICRATE;
/// Round re-proof: tics after the round start at which results are broadcast.
pub const CHALLENGEALL_SENDRESULTS: u32 = 10 * TICRATE;
/// Round re-proof: tics after the round start after which a client without
/// results disconnects.
pub const CHALLENGEALL_CLIENTCUTOFF: u32 = 15 * TICRATE;

/// Errors raised by the trust engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustError {
    /// A public key is not a valid ed25519 point.
    InvalidKey,
    /// A signature did not verify.
    BadSignature {
        /// The player whose signature failed, if known.
        slot: Option<PlayerSlot>,
    },
    /// The number of signatures does not match the number of players.
    SignatureCount {
        /// Signatures required.
        expected: usize,
        /// Signatures present.
        actual: usize,
    },
    /// The local identity cannot be used.
    InvalidIdentity {
        /// What is wrong with it.
        info: String,
    },
}

impl fmt::Display for TrustError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidKey => write!(f, "invalid public key"),
            Self::BadSignature { slot: Some(slot) } => {
                write!(f, "signature of player {} did not verify", slot)
            },
            Self::BadSignature { slot: None } => write!(f, "signature did not verify"),
            Self::SignatureCount { expected, actual } => {
                write!(f, "expected {} signatures, got {}", expected, actual)
            },
            Self::InvalidIdentity { info } => write!(f, "invalid identity: {}", info),
        }
    }
}

impl std::error::Error for TrustError {}

/// Whether a challenge may be signed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ShouldSign {
    /// The challenge is fresh and addressed to the server we talk to.
    Ok,
    /// The embedded time is too far from the local clock.
    BadTime,
    /// The embedded address is not the server we talk to.
    BadIp,
}

/// The local players' names and signing keys, in splitscreen order.
///
/// ```
/// use kart_netsync::LocalIdentity;
///
/// let identity = LocalIdentity::generate(&["Sonic", "Tails"]).unwrap();
/// assert_eq!(identity.len(), 2);
/// assert_eq!(identity.public_keys().len(), 2);
/// ```
#[derive(Clone)]
pub struct LocalIdentity {
    players: Vec<(String, SigningKey)>,
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("names", &self.names().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl LocalIdentity {
    /// Uses existing keys.
    pub fn new(players: Vec<(String, SigningKey)>) -> Result<Self, TrustError> {
        if players.len() > MAXSPLITSCREENPLAYERS {
            return Err(TrustError::InvalidIdentity {
                info: format!("{} local players, at most {}", players.len(), MAXSPLITSCREENPLAYERS),
            });
        }
        if let Some((name, _)) = players
            .iter()
            .find(|(name, _)| name.is_empty() || name.len() > MAXPLAYERNAME)
        {
            return Err(TrustError::InvalidIdentity {
                info: format!("player name {:?} must be 1 to {} bytes", name, MAXPLAYERNAME),
            });
        }
        Ok(Self { players })
    }

    /// Generates a fresh key for each name.
    pub fn generate(names: &[&str]) -> Result<Self, TrustError> {
        Self::new(
            names
                .iter()
                .map(|name| ((*name).to_owned(), SigningKey::generate(&mut OsRng)))
                .collect(),
        )
    }

    /// A dedicated server's identity: no local players.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            players: Vec::new(),
        }
    }

    /// Number of local players.
    #[must_use]
    pub fn len(&self) -> usize {
        self.players.len()
    }

    /// Returns `true` if there are no local players.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Player names in splitscreen order.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.players.iter().map(|(name, _)| name.as_str())
    }

    /// Public keys in splitscreen order.
    #[must_use]
    pub fn public_keys(&self) -> Vec<PublicKeyBytes> {
        self.players
            .iter()
            .map(|(_, key)| PublicKeyBytes(key.verifying_key().to_bytes()))
            .collect()
    }

    /// One signature over `message` per local player.
    #[must_use]
    pub fn sign_all(&self, message: &[u8]) -> Vec<SignatureBytes> {
        self.players.iter().map(|(_, key)| sign(key, message)).collect()
    }

    /// The first `count` players' signatures over `message`.
    #[must_use]
    pub fn sign_first(&self, count: usize, message: &[u8]) -> Vec<SignatureBytes> {
        self.players
            .iter()
            .take(count)
            .map(|(_, key)| sign(key, message))
            .collect()
    }

    /// One player's signature over `message`.
    #[must_use]
    pub fn sign_as(&self, split: usize, message: &[u8]) -> Option<SignatureBytes> {
        self.players.get(split).map(|(_, key)| sign(key, message))
    }
}

/// Signs `message`.
#[must_use]
pub fn sign(key: &SigningKey, message: &[u8]) -> SignatureBytes {
    SignatureBytes(key.sign(message).to_bytes())
}

/// Verifies a signature.
pub fn verify(
    key: &PublicKeyBytes,
    message: &[u8],
    signature: &SignatureBytes,
) -> Result<(), TrustError> {
    let key = VerifyingKey::from_bytes(&key.0).map_err(|_| TrustError::InvalidKey)?;
    key.verify(message, &Signature::from_bytes(&signature.0))
        .map_err(|_| TrustError::BadSignature { slot: None })
}

/// Verifies one signature per key, in order.
pub fn verify_all(
    keys: &[PublicKeyBytes],
    message: &[u8],
    signatures: &[SignatureBytes],
) -> Result<(), TrustError> {
    if keys.len() != signatures.len() {
        return Err(TrustError::SignatureCount {
            expected: keys.len(),
            actual: signatures.len(),
        });
    }
    keys.iter()
        .zip(signatures)
        .try_for_each(|(key, signature)| verify(key, message, signature))
}

/// Seconds since the unix epoch.
#[must_use]
pub fn unix_time_now() -> u64 {
    web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

/// Builds a challenge for `unix_time` bound to `server_ip`.
#[must_use]
pub fn build_challenge(unix_time: u64, server_ip: Ipv4Addr, rng: &mut impl RngCore) -> Challenge {
    let mut bytes = [0u8; 64];
    bytes[..8].copy_from_slice(&unix_time.to_le_bytes());
    bytes[8..12].copy_from_slice(&server_ip.octets());
    rng.fill_bytes(&mut bytes[12..]);
    Challenge(bytes)
}

/// The time and address embedded in a challenge.
#[must_use]
pub fn challenge_parts(challenge: &Challenge) -> (u64, Ipv4Addr) {
    let mut time = [0u8; 8];
    time.copy_from_slice(&challenge.0[..8]);
    let ip = Ipv4Addr::new(challenge.0[8], challenge.0[9], challenge.0[10], challenge.0[11]);
    (u64::from_le_bytes(time), ip)
}

/// Returns `true` for addresses reachable from the public internet.
///
/// ```
/// use kart_netsync::__internal::is_external_ip;
/// use std::net::Ipv4Addr;
///
/// assert!(is_external_ip(Ipv4Addr::new(203, 0, 113, 9)));
/// assert!(!is_external_ip(Ipv4Addr::new(192, 168, 1, 20)));
/// assert!(!is_external_ip(Ipv4Addr::LOCALHOST));
/// ```
#[must_use]
pub fn is_external_ip(ip: Ipv4Addr) -> bool {
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast())
}

/// Decides whether a challenge received from `real_ip` may be signed at
/// `now_unix`.
///
/// A mismatching address is tolerated when the real address is not external:
/// a server behind NAT or on a LAN does not know the address its clients use.
pub fn should_sign_challenge(
    challenge: &Challenge,
    real_ip: Option<Ipv4Addr>,
    now_unix: u64,
    max_skew_secs: u64,
) -> ShouldSign {
    let (then, claimed_ip) = challenge_parts(challenge);
    if now_unix.abs_diff(then) > max_skew_secs {
        return ShouldSign::BadTime;
    }
    match real_ip {
        Some(real) if real != claimed_ip && is_external_ip(real) => ShouldSign::BadIp,
        _ => ShouldSign::Ok,
    }
}

/// Server-side state of one round re-proof.
#[derive(Debug, Clone)]
pub struct ServerRound {
    start: Tic,
    challenge: Option<Challenge>,
    responses: [Option<SignatureBytes>; MAXPLAYERS],
    checked: bool,
    results_sent: bool,
}

impl ServerRound {
    /// A round starting at `start`.
    #[must_use]
    pub fn new(start: Tic) -> Self {
        Self {
            start,
            challenge: None,
            responses: [None; MAXPLAYERS],
            checked: false,
            results_sent: false,
        }
    }

    /// The round start tic.
    #[must_use]
    pub const fn start(&self) -> Tic {
        self.start
    }

    /// The shared challenge, once issued.
    #[must_use]
    pub const fn challenge(&self) -> Option<&Challenge> {
        self.challenge.as_ref()
    }

    /// Returns `true` if the challenge should go out at `now`.
    #[must_use]
    pub fn due_to_challenge(&self, now: Tic) -> bool {
        self.challenge.is_none() && now >= self.start
    }

    /// Records the issued challenge.
    pub fn issue(&mut self, challenge: Challenge) {
        self.challenge = Some(challenge);
    }

    /// Returns `true` if responses are still accepted at `now`.
    #[must_use]
    pub fn accepts_responses(&self, now: Tic) -> bool {
        self.challenge.is_some() && now - self.start <= i64::from(CHALLENGEALL_KICKUNRESPONSIVE)
    }

    /// Stores a verified response.
    pub fn record_response(&mut self, slot: PlayerSlot, signature: SignatureBytes) {
        self.responses[slot.as_usize()] = Some(signature);
    }

    /// The verified response of `slot`.
    #[must_use]
    pub fn response(&self, slot: PlayerSlot) -> Option<SignatureBytes> {
        self.responses[slot.as_usize()]
    }

    /// Returns `true` once, when unresponsive players should be kicked.
    pub fn take_kick_deadline(&mut self, now: Tic) -> bool {
        if self.checked || self.challenge.is_none() {
            return false;
        }
        if now - self.start > i64::from(CHALLENGEALL_KICKUNRESPONSIVE) {
            self.checked = true;
            return true;
        }
        false
    }

    /// Returns `true` once, when results should be broadcast.
    pub fn take_results_deadline(&mut self, now: Tic) -> bool {
        if self.results_sent || !self.checked {
            return false;
        }
        if now - self.start >= i64::from(CHALLENGEALL_SENDRESULTS) {
            self.results_sent = true;
            return true;
        }
        false
    }

    /// Returns `true` when the round is over.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.results_sent
    }
}

/// Client-side state of one round re-proof.
#[derive(Debug, Clone)]
pub struct ClientRound {
    start: Tic,
    joined_at_start: Option<bool>,
    challenge: Option<Challenge>,
    results_verified: bool,
}

impl ClientRound {
    /// A round starting at `start`.
    #[must_use]
    pub const fn new(start: Tic) -> Self {
        Self {
            start,
            joined_at_start: None,
            challenge: None,
            results_verified: false,
        }
    }

    /// Notes whether the client was in game when the round started.
    pub fn observe(&mut self, now: Tic, joined: bool) {
        if self.joined_at_start.is_none() && now >= self.start {
            self.joined_at_start = Some(joined);
        }
    }

    /// Records the challenge that was answered.
    pub fn answered(&mut self, challenge: Challenge) {
        self.challenge = Some(challenge);
    }

    /// The answered challenge.
    #[must_use]
    pub const fn challenge(&self) -> Option<&Challenge> {
        self.challenge.as_ref()
    }

    /// Marks the results as verified.
    pub fn verified(&mut self) {
        self.results_verified = true;
    }

    /// Returns `true` if the client must disconnect for lack of results.
    #[must_use]
    pub fn missed_cutoff(&self, now: Tic) -> bool {
        self.joined_at_start == Some(true)
            && !self.results_verified
            && now - self.start >= i64::from(CHALLENGEALL_CLIENTCUTOFF)
    }

    /// Returns `true` when nothing more can happen in this round.
    #[must_use]
    pub fn is_finished(&self, now: Tic) -> bool {
        self.results_verified || now - self.start >= i64::from(CHALLENGEALL_CLIENTCUTOFF)
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    const SKEW: u64 = 15 * 60;

    fn challenge_at(time: u64, ip: Ipv4Addr) -> Challenge {
        build_challenge(time, ip, &mut SmallRng::seed_from_u64(7))
    }

    #[test]
    fn challenge_layout() {
        let challenge = challenge_at(0x0102_0304_0506_0708, Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(&challenge.0[..8], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(&challenge.0[8..12], &[10, 1, 2, 3]);
        assert_eq!(
            challenge_parts(&challenge),
            (0x0102_0304_0506_0708, Ipv4Addr::new(10, 1, 2, 3))
        );
    }

    #[test]
    fn stale_challenges_are_refused() {
        let now = 1_700_000_000;
        let ip = Ipv4Addr::new(198, 51, 100, 4);
        let fresh = challenge_at(now - SKEW, ip);
        assert_eq!(should_sign_challenge(&fresh, Some(ip), now, SKEW), ShouldSign::Ok);
        let stale = challenge_at(now - SKEW - 1, ip);
        assert_eq!(should_sign_challenge(&stale, Some(ip), now, SKEW), ShouldSign::BadTime);
        let future = challenge_at(now + SKEW + 1, ip);
        assert_eq!(should_sign_challenge(&future, Some(ip), now, SKEW), ShouldSign::BadTime);
    }

    #[test]
    fn mismatched_external_address_is_refused() {
        let now = 1_700_000_000;
        let claimed = Ipv4Addr::new(198, 51, 100, 4);
        let challenge = challenge_at(now, claimed);
        assert_eq!(
            should_sign_challenge(&challenge, Some(Ipv4Addr::new(203, 0, 113, 7)), now, SKEW),
            ShouldSign::BadIp
        );
        assert_eq!(
            should_sign_challenge(&challenge, Some(Ipv4Addr::new(192, 168, 0, 2)), now, SKEW),
            ShouldSign::Ok
        );
        assert_eq!(
            should_sign_challenge(&challenge, Some(Ipv4Addr::LOCALHOST), now, SKEW),
            ShouldSign::Ok
        );
    }

    #[test]
    fn signatures_verify_only_with_matching_key_and_message() {
        let alice = LocalIdentity::generate(&["alice"]).unwrap();
        let bob = LocalIdentity::generate(&["bob"]).unwrap();
        let signature = alice.sign_as(0, b"lap 3").unwrap();
        let key = alice.public_keys()[0];
        assert!(verify(&key, b"lap 3", &signature).is_ok());
        assert!(verify(&key, b"lap 4", &signature).is_err());
        assert!(verify(&bob.public_keys()[0], b"lap 3", &signature).is_err());
    }

    #[test]
    fn verify_all_checks_counts() {
        let identity = LocalIdentity::generate(&["a", "b"]).unwrap();
        let signatures = identity.sign_all(b"bundle");
        assert!(verify_all(&identity.public_keys(), b"bundle", &signatures).is_ok());
        assert_eq!(
            verify_all(&identity.public_keys(), b"bundle", &signatures[..1]),
            Err(TrustError::SignatureCount {
                expected: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn identity_limits() {
        assert!(LocalIdentity::generate(&["a", "b", "c", "d", "e"]).is_err());
        assert!(LocalIdentity::generate(&[""]).is_err());
        assert!(LocalIdentity::generate(&["a name that is far too long"]).is_err());
        assert!(LocalIdentity::empty().is_empty());
    }

    #[test]
    fn server_round_deadlines() {
        let start = Tic::new(100);
        let mut round = ServerRound::new(start);
        assert!(!round.due_to_challenge(Tic::new(99)));
        assert!(round.due_to_challenge(start));
        round.issue(challenge_at(0, Ipv4Addr::UNSPECIFIED));
        let deadline = start + CHALLENGEALL_KICKUNRESPONSIVE;
        assert!(round.accepts_responses(deadline));
        assert!(!round.accepts_responses(deadline + 1));
        assert!(!round.take_kick_deadline(deadline));
        assert!(round.take_kick_deadline(deadline + 1));
        assert!(!round.take_kick_deadline(deadline + 2));
        assert!(!round.take_results_deadline((start + CHALLENGEALL_SENDRESULTS).saturating_sub(1)));
        assert!(round.take_results_deadline(start + CHALLENGEALL_SENDRESULTS));
        assert!(round.is_finished());
    }

    #[test]
    fn client_cutoff_only_applies_to_players_in_game_at_start() {
        let start = Tic::new(10);
        let cutoff = start + CHALLENGEALL_CLIENTCUTOFF;
        let mut in_game = ClientRound::new(start);
        in_game.observe(start, true);
        assert!(!in_game.missed_cutoff(cutoff.saturating_sub(1)));
        assert!(in_game.missed_cutoff(cutoff));

        let mut late = ClientRound::new(start);
        late.observe(start + 1, false);
        assert!(!late.missed_cutoff(cutoff));

        let mut verified = ClientRound::new(start);
        verified.observe(start, true);
        verified.verified();
        assert!(!verified.missed_cutoff(cutoff));
    }
}
