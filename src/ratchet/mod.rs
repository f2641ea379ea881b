//! Per-session epoch state: direction keys, sequence counters, and forward
//! secrecy through one-way epoch advancement.

use std::time::Duration;

use bytes::Bytes;
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::seal::{OpeningContext, SealingContext};
use crate::crypto::SymmetricKey;
use crate::error::{CryptoError, Error, ProtocolError};
use crate::frame::{Flags, Frame, FrameType};

/// Which side of the channel a ratchet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The client; it drives epoch rotation.
    Initiator,
    /// The enclave; it follows the initiator's epoch.
    Responder,
}

/// Direction of travel for a key or a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    InitiatorToResponder,
    ResponderToInitiator,
}

impl Direction {
    fn label(self) -> &'static [u8] {
        match self {
            Self::InitiatorToResponder => b"tts-i2r",
            Self::ResponderToInitiator => b"tts-r2i",
        }
    }
}

impl Role {
    fn send_direction(self) -> Direction {
        match self {
            Role::Initiator => Direction::InitiatorToResponder,
            Role::Responder => Direction::ResponderToInitiator,
        }
    }

    fn receive_direction(self) -> Direction {
        match self {
            Role::Initiator => Direction::ResponderToInitiator,
            Role::Responder => Direction::InitiatorToResponder,
        }
    }
}

/// When the initiator advances the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationPolicy {
    /// After every successfully completed request.
    #[default]
    EveryRequest,
    /// After every `n` successfully completed requests.
    EveryNRequests(u32),
    /// After the first completed request once the epoch is at least this old.
    Interval(Duration),
    /// Only on an explicit [`GroupRatchet::advance_epoch`].
    Manual,
}

/// Root secret of a single epoch. Zeroed on drop, never cloned or logged.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct EpochSecret {
    root: [u8; 32],
    epoch: u32,
}

impl EpochSecret {
    fn new(root: &SymmetricKey, epoch: u32) -> Self {
        Self {
            root: *root.as_bytes(),
            epoch,
        }
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    fn direction_key(&self, direction: Direction) -> Result<SymmetricKey, CryptoError> {
        let hkdf = Hkdf::<Sha256>::from_prk(&self.root).map_err(|_| CryptoError::HkdfExpandFailed)?;
        let mut key = [0u8; 32];
        hkdf.expand(direction.label(), &mut key)
            .map_err(|_| CryptoError::HkdfExpandFailed)?;
        let out = SymmetricKey::from(key);
        key.zeroize();
        Ok(out)
    }

    /// One-way step to the next epoch's root.
    fn next(&self) -> Result<Self, CryptoError> {
        let epoch = self
            .epoch
            .checked_add(1)
            .ok_or(CryptoError::NonceOverflow)?;
        let hkdf = Hkdf::<Sha256>::from_prk(&self.root).map_err(|_| CryptoError::HkdfExpandFailed)?;
        let mut info = Vec::with_capacity(21);
        info.extend_from_slice(b"tts-epoch-advance");
        info.extend_from_slice(&epoch.to_be_bytes());
        let mut root = [0u8; 32];
        hkdf.expand(&info, &mut root)
            .map_err(|_| CryptoError::HkdfExpandFailed)?;
        let next = Self { root, epoch };
        root.zeroize();
        Ok(next)
    }
}

struct EpochState {
    secret: EpochSecret,
    sealer: SealingContext,
    opener: OpeningContext,
}

impl EpochState {
    fn new(secret: EpochSecret, role: Role, session_id: [u8; 32]) -> Result<Self, CryptoError> {
        let epoch = secret.epoch;
        let send = secret.direction_key(role.send_direction())?;
        let recv = secret.direction_key(role.receive_direction())?;
        Ok(Self {
            sealer: SealingContext::new(&send, session_id, epoch),
            opener: OpeningContext::new(&recv, session_id, epoch),
            secret,
        })
    }
}

/// Evolving key state of one channel, owned by exactly one session.
///
/// Both sides run the same ratchet, parameterized by [`Role`]. Only the
/// initiator applies the [`RotationPolicy`]; the responder follows the epoch
/// announced in the initiator's frames.
pub struct GroupRatchet {
    role: Role,
    session_id: [u8; 32],
    policy: RotationPolicy,
    epoch: u32,
    /// `None` once discarded.
    state: Option<EpochState>,
    completed_in_epoch: u32,
    epoch_started: Instant,
}

impl GroupRatchet {
    /// Create the epoch-0 state from the handshake's root secret.
    pub fn new(
        role: Role,
        session_id: [u8; 32],
        root: &SymmetricKey,
        policy: RotationPolicy,
    ) -> Result<Self, CryptoError> {
        let state = EpochState::new(EpochSecret::new(root, 0), role, session_id)?;
        Ok(Self {
            role,
            session_id,
            policy,
            epoch: 0,
            state: Some(state),
            completed_in_epoch: 0,
            epoch_started: Instant::now(),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn session_id(&self) -> &[u8; 32] {
        &self.session_id
    }

    pub fn policy(&self) -> RotationPolicy {
        self.policy
    }

    /// Current epoch number (the last one, if discarded).
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn is_discarded(&self) -> bool {
        self.state.is_none()
    }

    fn current(&self, epoch: u32) -> Result<&EpochState, CryptoError> {
        let state = self.state.as_ref().ok_or(CryptoError::Discarded)?;
        if epoch != state.secret.epoch() {
            return Err(CryptoError::EpochRetired {
                requested: epoch,
                current: self.epoch,
            });
        }
        Ok(state)
    }

    /// Key this side sends with in `epoch`. Only the current epoch is derivable.
    pub fn derive_send_key(&self, epoch: u32) -> Result<SymmetricKey, CryptoError> {
        self.current(epoch)?
            .secret
            .direction_key(self.role.send_direction())
    }

    /// Key this side receives with in `epoch`. Only the current epoch is derivable.
    pub fn derive_receive_key(&self, epoch: u32) -> Result<SymmetricKey, CryptoError> {
        self.current(epoch)?
            .secret
            .direction_key(self.role.receive_direction())
    }

    /// Key confirmation value for the current epoch, identical on both sides.
    pub fn confirmation(&self) -> Result<[u8; 32], CryptoError> {
        let state = self.current(self.epoch)?;
        let i2r = state.secret.direction_key(Direction::InitiatorToResponder)?;
        let r2i = state.secret.direction_key(Direction::ResponderToInitiator)?;

        let mut hasher = Sha256::new();
        hasher.update(b"tts-confirmation");
        hasher.update(self.session_id);
        hasher.update(i2r.as_bytes());
        hasher.update(r2i.as_bytes());
        Ok(hasher.finalize().into())
    }

    /// Derive the next epoch and destroy the current one.
    ///
    /// Sequence counters restart at 0 in the new epoch.
    pub fn advance_epoch(&mut self) -> Result<u32, CryptoError> {
        let current = self.state.take().ok_or(CryptoError::Discarded)?;
        let next = current.secret.next()?;
        drop(current);

        self.epoch = next.epoch();
        self.state = Some(EpochState::new(next, self.role, self.session_id)?);
        self.completed_in_epoch = 0;
        self.epoch_started = Instant::now();
        tracing::info!(epoch = self.epoch, role = ?self.role, "epoch advanced");
        Ok(self.epoch)
    }

    /// Record a successfully completed request and apply the rotation policy.
    ///
    /// Returns whether the epoch advanced. A no-op on the responder.
    pub fn request_completed(&mut self) -> Result<bool, CryptoError> {
        if self.role == Role::Responder {
            return Ok(false);
        }
        self.completed_in_epoch = self.completed_in_epoch.saturating_add(1);
        let due = match self.policy {
            RotationPolicy::EveryRequest => true,
            RotationPolicy::EveryNRequests(n) => self.completed_in_epoch >= n.max(1),
            RotationPolicy::Interval(period) => self.epoch_started.elapsed() >= period,
            RotationPolicy::Manual => false,
        };
        if due {
            self.advance_epoch()?;
        }
        Ok(due)
    }

    /// Accept the epoch carried by an inbound frame while no request is in
    /// flight. The responder steps forward by exactly one epoch; anything else
    /// must equal the current epoch.
    pub fn follow(&mut self, epoch: u32) -> Result<(), Error> {
        if self.state.is_none() {
            return Err(CryptoError::Discarded.into());
        }
        if epoch == self.epoch {
            return Ok(());
        }
        if self.role == Role::Responder && Some(epoch) == self.epoch.checked_add(1) {
            self.advance_epoch()?;
            return Ok(());
        }
        Err(ProtocolError::EpochMismatch {
            current: self.epoch,
            received: epoch,
        }
        .into())
    }

    /// Encrypt `plaintext` into a frame of the current epoch.
    pub fn seal(&mut self, msg_type: FrameType, flags: Flags, plaintext: &[u8]) -> Result<Frame, Error> {
        let epoch = self.epoch;
        let state = self.state.as_mut().ok_or(CryptoError::Discarded)?;
        let wire_flags = flags.with(Flags::ENCRYPTED);
        let (ciphertext, sequence) = state
            .sealer
            .seal(plaintext, msg_type as u8, wire_flags.raw())?;
        Ok(Frame::sealed(
            msg_type,
            wire_flags,
            epoch,
            sequence,
            Bytes::from(ciphertext),
        ))
    }

    /// Decrypt a frame of the current epoch.
    ///
    /// The epoch and exact sequence are checked before the AEAD.
    pub fn open(&mut self, frame: &Frame) -> Result<Bytes, Error> {
        let state = self.state.as_mut().ok_or(CryptoError::Discarded)?;
        if !frame.header.flags.is_encrypted() {
            return Err(ProtocolError::MalformedChunk("plaintext frame after handshake").into());
        }
        if frame.header.epoch != self.epoch {
            return Err(ProtocolError::EpochMismatch {
                current: self.epoch,
                received: frame.header.epoch,
            }
            .into());
        }
        let plaintext = state.opener.open(
            &frame.payload,
            frame.header.sequence,
            frame.header.msg_type as u8,
            frame.header.flags.raw(),
        )?;
        Ok(Bytes::from(plaintext))
    }

    /// Destroy all key material. Every later operation fails with
    /// [`CryptoError::Discarded`].
    pub fn discard(&mut self) {
        if self.state.take().is_some() {
            tracing::debug!(epoch = self.epoch, role = ?self.role, "ratchet discarded");
        }
    }
}

impl std::fmt::Debug for GroupRatchet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupRatchet")
            .field("role", &self.role)
            .field("epoch", &self.epoch)
            .field("policy", &self.policy)
            .field("discarded", &self.is_discarded())
            .finish_non_exhaustive()
    }
}
