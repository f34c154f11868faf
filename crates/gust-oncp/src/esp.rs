//! ESP datagram processing.
//!
//! Wire layout of an inbound datagram:
//!
//! ```text
//! 0..3      SPI
//! 4..7      sequence number (big endian)
//! 8..23     IV (16 bytes)
//! 24..N-13  ciphertext (payload, padding, pad_len, next_header)
//! N-12..N-1 HMAC truncated to 12 bytes
//! ```
//!
//! Verification order: SPI, HMAC (constant time), replay window, decrypt,
//! trailer. A packet failing any check is dropped and logged; the
//! datapath never dies over one bad datagram.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::NoPadding};
use bytes::{BufMut, BytesMut};
use gust_core::{KeyMaterial, debug};
use hmac::{Hmac, Mac};
use md5::Md5;
use num_enum::{FromPrimitive, IntoPrimitive};
use rand::RngCore;
use sha1::Sha1;
use snafu::prelude::*;
use tokio::sync::mpsc;
use zeroize::Zeroizing;

const ESP_IV_LEN: usize = 16;
const ESP_BLOCK: usize = 16;
const HMAC_TRUNC: usize = 12;
/// SPI + sequence + IV before the ciphertext begins.
const ESP_HEADER: usize = 8 + ESP_IV_LEN;

pub const NEXT_HEADER_IP4: u8 = 0x04;
pub const NEXT_HEADER_IP6: u8 = 0x29;
/// LZO-compressed payloads are announced with this id; not supported.
pub const NEXT_HEADER_LZO: u8 = 0x05;

/// Cipher half of the negotiated suite byte pair.
#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EspCipher {
	Aes128Cbc = 0x02,
	Aes256Cbc = 0x05,
	#[num_enum(catch_all)]
	Other(u8),
}

impl EspCipher {
	fn key_len(self) -> usize {
		match self {
			EspCipher::Aes128Cbc => 16,
			EspCipher::Aes256Cbc => 32,
			EspCipher::Other(_) => 0,
		}
	}
}

/// HMAC half of the negotiated suite byte pair. The HMAC key length
/// equals the MAC output length.
#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EspHmac {
	Md5  = 0x01,
	Sha1 = 0x02,
	#[num_enum(catch_all)]
	Other(u8),
}

impl EspHmac {
	fn key_len(self) -> usize {
		match self {
			EspHmac::Md5 => 16,
			EspHmac::Sha1 => 20,
			EspHmac::Other(_) => 0,
		}
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DtlsState {
	/// ESP turned off for this session; key setup is refused.
	Disabled,
	/// Enabled but not yet keyed.
	NoSecret,
	Secret,
	Connected,
	Established,
	Sleeping,
	Reconnecting,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum EspError {
	#[snafu(display("ESP is disabled for this session"))]
	Disabled,
	#[snafu(display("unsupported ESP {kind} id {value:#04x}"))]
	UnsupportedSuite { kind: &'static str, value: u8 },
	#[snafu(display("ESP key material has {got} bytes, expected {expected}"))]
	BadKeyLength { expected: usize, got: usize },
	#[snafu(display("ESP keys are not set up for this direction"))]
	NotKeyed,
	#[snafu(display("ESP packet of {len} bytes is too short"))]
	TooShort { len: usize },
	#[snafu(display("ESP packet with invalid SPI {spi}"))]
	SpiMismatch { spi: String },
	#[snafu(display("ESP packet with invalid HMAC"))]
	BadHmac,
	#[snafu(display("replayed or out-of-window ESP sequence {seq}"))]
	Replayed { seq: u32 },
	#[snafu(display("ESP ciphertext of {len} bytes is not block-aligned"))]
	BadCipherLength { len: usize },
	#[snafu(display("ESP packet with unrecognised payload type {next_header:#04x}"))]
	UnsupportedPayload { next_header: u8 },
	#[snafu(display("invalid padding length {pad_len} in ESP packet"))]
	BadPadding { pad_len: u8 },
	#[snafu(display("tunnel ingress queue is gone"))]
	QueueClosed,
}

impl EspError {
	/// Per-packet failures: log, drop, carry on.
	pub fn is_bad_packet(&self) -> bool {
		matches!(
			self,
			EspError::TooShort { .. }
				| EspError::SpiMismatch { .. }
				| EspError::BadHmac
				| EspError::Replayed { .. }
				| EspError::BadCipherLength { .. }
				| EspError::UnsupportedPayload { .. }
				| EspError::BadPadding { .. }
		)
	}
}

/// A decrypted tunnel packet, headed for the tun device.
#[derive(Debug, PartialEq, Eq)]
pub struct Packet {
	pub data: Vec<u8>,
}

/// Sliding-window replay filter: a 64-entry bitmap anchored at the
/// highest sequence that passed HMAC verification.
#[derive(Debug, Default)]
pub struct ReplayWindow {
	highest: u32,
	bitmap:  u64,
}

impl ReplayWindow {
	const WINDOW: u32 = 64;

	/// Accept-and-record. Rejects duplicates and anything older than the
	/// window.
	pub fn check_and_update(&mut self, seq: u32) -> bool {
		if seq > self.highest {
			let shift = seq - self.highest;
			self.bitmap = if shift >= Self::WINDOW {
				1
			} else {
				(self.bitmap << shift) | 1
			};
			self.highest = seq;
			return true;
		}
		let age = self.highest - seq;
		if age >= Self::WINDOW {
			return false;
		}
		let bit = 1u64 << age;
		if self.bitmap & bit != 0 {
			return false;
		}
		self.bitmap |= bit;
		true
	}

	pub fn reset(&mut self) {
		*self = Self::default();
	}
}

/// One keyed direction. Cipher and HMAC state exist together or not at
/// all; the invariant is structural.
struct EspDirection {
	spi:     [u8; 4],
	cipher:  EspCipher,
	hmac:    EspHmac,
	/// `enc_key ∥ hmac_key`, zeroed on drop.
	secrets: KeyMaterial,
}

impl EspDirection {
	fn new(cipher: EspCipher, hmac: EspHmac, spi: [u8; 4], secrets: KeyMaterial) -> Result<Self, EspError> {
		let expected = cipher.key_len() + hmac.key_len();
		ensure!(
			secrets.len() == expected,
			BadKeyLengthSnafu { expected, got: secrets.len() }
		);
		Ok(Self { spi, cipher, hmac, secrets })
	}

	fn enc_key(&self) -> &[u8] {
		&self.secrets[..self.cipher.key_len()]
	}

	fn hmac_key(&self) -> &[u8] {
		&self.secrets[self.cipher.key_len()..]
	}

	fn verify_hmac(&self, data: &[u8], tag: &[u8]) -> bool {
		match self.hmac {
			EspHmac::Md5 => {
				let mut mac = Hmac::<Md5>::new_from_slice(self.hmac_key()).expect("any key length");
				mac.update(data);
				mac.verify_truncated_left(tag).is_ok()
			}
			EspHmac::Sha1 => {
				let mut mac = Hmac::<Sha1>::new_from_slice(self.hmac_key()).expect("any key length");
				mac.update(data);
				mac.verify_truncated_left(tag).is_ok()
			}
			EspHmac::Other(_) => false,
		}
	}

	fn compute_hmac(&self, data: &[u8]) -> [u8; HMAC_TRUNC] {
		let mut tag = [0u8; HMAC_TRUNC];
		match self.hmac {
			EspHmac::Md5 => {
				let mut mac = Hmac::<Md5>::new_from_slice(self.hmac_key()).expect("any key length");
				mac.update(data);
				tag.copy_from_slice(&mac.finalize().into_bytes()[..HMAC_TRUNC]);
			}
			EspHmac::Sha1 => {
				let mut mac = Hmac::<Sha1>::new_from_slice(self.hmac_key()).expect("any key length");
				mac.update(data);
				tag.copy_from_slice(&mac.finalize().into_bytes()[..HMAC_TRUNC]);
			}
			EspHmac::Other(_) => {}
		}
		tag
	}

	fn decrypt(&self, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, EspError> {
		let plain = match self.cipher {
			EspCipher::Aes128Cbc => cbc::Decryptor::<aes::Aes128>::new_from_slices(self.enc_key(), iv)
				.expect("key and IV lengths validated at setup")
				.decrypt_padded_vec_mut::<NoPadding>(ciphertext),
			EspCipher::Aes256Cbc => cbc::Decryptor::<aes::Aes256>::new_from_slices(self.enc_key(), iv)
				.expect("key and IV lengths validated at setup")
				.decrypt_padded_vec_mut::<NoPadding>(ciphertext),
			EspCipher::Other(value) => {
				return UnsupportedSuiteSnafu { kind: "cipher", value }.fail();
			}
		};
		plain.ok().context(BadCipherLengthSnafu { len: ciphertext.len() })
	}

	fn encrypt(&self, iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, EspError> {
		let out = match self.cipher {
			EspCipher::Aes128Cbc => cbc::Encryptor::<aes::Aes128>::new_from_slices(self.enc_key(), iv)
				.expect("key and IV lengths validated at setup")
				.encrypt_padded_vec_mut::<NoPadding>(plaintext),
			EspCipher::Aes256Cbc => cbc::Encryptor::<aes::Aes256>::new_from_slices(self.enc_key(), iv)
				.expect("key and IV lengths validated at setup")
				.encrypt_padded_vec_mut::<NoPadding>(plaintext),
			EspCipher::Other(value) => {
				return UnsupportedSuiteSnafu { kind: "cipher", value }.fail();
			}
		};
		Ok(out)
	}
}

/// The ESP half of a session: one inbound and one outbound keying
/// context, the replay window, and the ingress queue feeding the tun
/// writer.
pub struct EspSession {
	state:    DtlsState,
	esp_in:   Option<EspDirection>,
	esp_out:  Option<EspDirection>,
	replay:   ReplayWindow,
	seq_out:  u32,
	queue_tx: mpsc::Sender<Packet>,
}

impl EspSession {
	pub fn new(enabled: bool, queue_depth: usize) -> (Self, mpsc::Receiver<Packet>) {
		let (queue_tx, queue_rx) = mpsc::channel(queue_depth);
		(
			Self {
				state: if enabled { DtlsState::NoSecret } else { DtlsState::Disabled },
				esp_in: None,
				esp_out: None,
				replay: ReplayWindow::default(),
				seq_out: 0,
				queue_tx,
			},
			queue_rx,
		)
	}

	pub fn state(&self) -> DtlsState {
		self.state
	}

	pub fn set_state(&mut self, state: DtlsState) {
		self.state = state;
	}

	fn suites(enc: u8, mac: u8) -> Result<(EspCipher, EspHmac), EspError> {
		let cipher = EspCipher::from(enc);
		ensure!(
			!matches!(cipher, EspCipher::Other(..)),
			UnsupportedSuiteSnafu { kind: "cipher", value: enc }
		);
		let hmac = EspHmac::from(mac);
		ensure!(
			!matches!(hmac, EspHmac::Other(..)),
			UnsupportedSuiteSnafu { kind: "hmac", value: mac }
		);
		Ok((cipher, hmac))
	}

	/// Draw a fresh inbound SPI and key block from the CSPRNG and set up
	/// the inbound direction. The material is what we announce to the
	/// gateway over the control channel.
	pub fn setup_keys(&mut self, enc: u8, mac: u8) -> Result<(), EspError> {
		ensure!(self.state != DtlsState::Disabled, DisabledSnafu);
		let (cipher, hmac) = Self::suites(enc, mac)?;

		let mut spi = [0u8; 4];
		rand::rng().fill_bytes(&mut spi);
		let mut secrets = Zeroizing::new(vec![0u8; cipher.key_len() + hmac.key_len()]);
		rand::rng().fill_bytes(&mut secrets);

		self.esp_in = Some(EspDirection::new(cipher, hmac, spi, secrets)?);
		self.replay.reset();
		self.state = DtlsState::Secret;
		Ok(())
	}

	/// Install inbound keys directly (key rollover, tests).
	pub fn set_inbound(&mut self, enc: u8, mac: u8, spi: [u8; 4], secrets: &[u8]) -> Result<(), EspError> {
		ensure!(self.state != DtlsState::Disabled, DisabledSnafu);
		let (cipher, hmac) = Self::suites(enc, mac)?;
		self.esp_in = Some(EspDirection::new(
			cipher,
			hmac,
			spi,
			Zeroizing::new(secrets.to_vec()),
		)?);
		self.replay.reset();
		self.state = DtlsState::Secret;
		Ok(())
	}

	/// Install the outbound keys announced by the gateway.
	pub fn set_outbound(&mut self, enc: u8, mac: u8, spi: [u8; 4], secrets: &[u8]) -> Result<(), EspError> {
		ensure!(self.state != DtlsState::Disabled, DisabledSnafu);
		let (cipher, hmac) = Self::suites(enc, mac)?;
		self.esp_out = Some(EspDirection::new(
			cipher,
			hmac,
			spi,
			Zeroizing::new(secrets.to_vec()),
		)?);
		self.seq_out = 0;
		Ok(())
	}

	pub fn inbound_spi(&self) -> Option<[u8; 4]> {
		self.esp_in.as_ref().map(|dir| dir.spi)
	}

	/// Inbound `enc_key ∥ hmac_key`, for provisioning the gateway.
	pub fn inbound_secrets(&self) -> Option<&[u8]> {
		self.esp_in.as_ref().map(|dir| dir.secrets.as_slice())
	}

	/// Discard queued-but-unconsumed packets (reconnect teardown).
	pub fn drain_queue(&mut self, queue_rx: &mut mpsc::Receiver<Packet>) {
		while queue_rx.try_recv().is_ok() {}
	}

	/// Verify, decrypt and enqueue one inbound datagram. Returns the
	/// payload length on success.
	pub async fn decrypt_and_queue(&mut self, esp: &[u8]) -> Result<usize, EspError> {
		let dir = self.esp_in.as_ref().context(NotKeyedSnafu)?;

		// Minimum: header, one ciphertext block, truncated HMAC.
		ensure!(
			esp.len() >= ESP_HEADER + ESP_BLOCK + HMAC_TRUNC,
			TooShortSnafu { len: esp.len() }
		);

		if esp[..4] != dir.spi {
			debug!(target: "[ESP]", "Received ESP packet with invalid SPI {}", hex::encode(&esp[..4]));
			return SpiMismatchSnafu { spi: hex::encode(&esp[..4]) }.fail();
		}
		let seq = u32::from_be_bytes(esp[4..8].try_into().expect("slice of four"));

		let (signed, tag) = esp.split_at(esp.len() - HMAC_TRUNC);
		if !dir.verify_hmac(signed, tag) {
			debug!(target: "[ESP]", "Received ESP packet with invalid HMAC");
			return BadHmacSnafu.fail();
		}

		if !self.replay.check_and_update(seq) {
			debug!(target: "[ESP]", "Rejected replayed ESP sequence {seq}");
			return ReplayedSnafu { seq }.fail();
		}

		let iv = &esp[8..8 + ESP_IV_LEN];
		let ciphertext = &signed[ESP_HEADER..];
		ensure!(
			!ciphertext.is_empty() && ciphertext.len() % ESP_BLOCK == 0,
			BadCipherLengthSnafu { len: ciphertext.len() }
		);

		let mut plain = dir.decrypt(iv, ciphertext)?;

		let next_header = plain[plain.len() - 1];
		if next_header != NEXT_HEADER_IP4 && next_header != NEXT_HEADER_IP6 {
			debug!(target: "[ESP]",
				"Received ESP packet with unrecognised payload type {next_header:#04x}");
			return UnsupportedPayloadSnafu { next_header }.fail();
		}
		let pad_len = plain[plain.len() - 2];
		ensure!(
			(pad_len as usize) + 2 <= plain.len(),
			BadPaddingSnafu { pad_len }
		);

		plain.truncate(plain.len() - 2 - pad_len as usize);
		let len = plain.len();

		self.queue_tx
			.send(Packet { data: plain })
			.await
			.ok()
			.context(QueueClosedSnafu)?;
		Ok(len)
	}

	/// Build one outbound datagram: SPI, next sequence, fresh IV,
	/// self-describing padding, trailer, HMAC truncated to 12 bytes.
	pub fn encrypt(&mut self, payload: &[u8], next_header: u8) -> Result<Vec<u8>, EspError> {
		let dir = self.esp_out.as_ref().context(NotKeyedSnafu)?;

		self.seq_out = self.seq_out.wrapping_add(1);

		let pad_len = (ESP_BLOCK - (payload.len() + 2) % ESP_BLOCK) % ESP_BLOCK;
		let mut plain = Vec::with_capacity(payload.len() + pad_len + 2);
		plain.extend_from_slice(payload);
		plain.extend((1..=pad_len as u8).collect::<Vec<u8>>());
		plain.push(pad_len as u8);
		plain.push(next_header);

		let mut iv = [0u8; ESP_IV_LEN];
		rand::rng().fill_bytes(&mut iv);

		let ciphertext = dir.encrypt(&iv, &plain)?;

		let mut pkt = BytesMut::with_capacity(ESP_HEADER + ciphertext.len() + HMAC_TRUNC);
		pkt.put_slice(&dir.spi);
		pkt.put_u32(self.seq_out);
		pkt.put_slice(&iv);
		pkt.put_slice(&ciphertext);
		let tag = dir.compute_hmac(&pkt);
		pkt.put_slice(&tag);
		Ok(pkt.to_vec())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	const ENC: u8 = 0x02; // AES-128-CBC
	const MAC: u8 = 0x02; // HMAC-SHA1

	const SPI: [u8; 4] = [0x01, 0x02, 0x03, 0x04];

	fn secrets() -> Vec<u8> {
		// 16 byte AES key followed by 20 byte HMAC-SHA1 key.
		(0u8..36).collect()
	}

	/// A session keyed with the same material both ways, so its own
	/// output feeds its input path.
	fn looped_session() -> (EspSession, mpsc::Receiver<Packet>) {
		let (mut esp, rx) = EspSession::new(true, 16);
		esp.set_inbound(ENC, MAC, SPI, &secrets()).unwrap();
		esp.set_outbound(ENC, MAC, SPI, &secrets()).unwrap();
		(esp, rx)
	}

	#[test]
	fn key_setup_refused_while_disabled() {
		let (mut esp, _rx) = EspSession::new(false, 16);
		assert!(matches!(esp.setup_keys(ENC, MAC), Err(EspError::Disabled)));
		assert_eq!(esp.state(), DtlsState::Disabled);
	}

	#[test]
	fn random_key_setup_reaches_secret_state() {
		let (mut esp, _rx) = EspSession::new(true, 16);
		esp.setup_keys(ENC, MAC).unwrap();
		assert_eq!(esp.state(), DtlsState::Secret);
		assert_eq!(esp.inbound_secrets().unwrap().len(), 16 + 20);
		assert!(esp.inbound_spi().is_some());

		// AES-256 with MD5: 32 + 16 key bytes.
		esp.setup_keys(0x05, 0x01).unwrap();
		assert_eq!(esp.inbound_secrets().unwrap().len(), 32 + 16);
	}

	#[test]
	fn unknown_suite_ids_are_rejected() {
		let (mut esp, _rx) = EspSession::new(true, 16);
		assert!(matches!(
			esp.setup_keys(0x03, MAC),
			Err(EspError::UnsupportedSuite { kind: "cipher", .. })
		));
		assert!(matches!(
			esp.setup_keys(ENC, 0x7f),
			Err(EspError::UnsupportedSuite { kind: "hmac", .. })
		));
	}

	#[test_log::test(tokio::test)]
	async fn encrypt_decrypt_round_trip() {
		let (mut esp, mut rx) = looped_session();
		let payload: Vec<u8> = (0u8..64).collect();

		let datagram = esp.encrypt(&payload, NEXT_HEADER_IP4).unwrap();
		assert_eq!(&datagram[..4], &SPI);
		// 64 byte payload + trailer pads to 80 ciphertext bytes.
		assert_eq!(datagram.len(), 8 + 16 + 80 + 12);

		let len = esp.decrypt_and_queue(&datagram).await.unwrap();
		assert_eq!(len, 64);
		assert_eq!(rx.try_recv().unwrap().data, payload);
	}

	#[test_log::test(tokio::test)]
	async fn flipped_hmac_is_dropped_without_enqueue() {
		let (mut esp, mut rx) = looped_session();
		let mut datagram = esp.encrypt(&[0u8; 64], NEXT_HEADER_IP4).unwrap();
		let last = datagram.len() - 1;
		datagram[last] ^= 0x01;

		let err = esp.decrypt_and_queue(&datagram).await.unwrap_err();
		assert!(matches!(err, EspError::BadHmac));
		assert!(err.is_bad_packet());
		assert!(rx.try_recv().is_err());
	}

	#[test_log::test(tokio::test)]
	async fn spi_mismatch_is_dropped() {
		let (mut esp, mut rx) = looped_session();
		let mut datagram = esp.encrypt(&[0u8; 64], NEXT_HEADER_IP4).unwrap();
		datagram[0] ^= 0xff;

		let err = esp.decrypt_and_queue(&datagram).await.unwrap_err();
		assert!(matches!(err, EspError::SpiMismatch { .. }));
		assert!(rx.try_recv().is_err());
	}

	#[test_log::test(tokio::test)]
	async fn minimum_length_datagram_is_rejected() {
		let (mut esp, _rx) = looped_session();
		// Exactly header + IV: no room for even one ciphertext block.
		let datagram = vec![0u8; 20 + 16];
		let err = esp.decrypt_and_queue(&datagram).await.unwrap_err();
		assert!(matches!(err, EspError::TooShort { .. }));
	}

	#[test_log::test(tokio::test)]
	async fn lzo_payload_is_unsupported() {
		let (mut esp, mut rx) = looped_session();
		let datagram = esp.encrypt(&[0u8; 62], NEXT_HEADER_LZO).unwrap();

		let err = esp.decrypt_and_queue(&datagram).await.unwrap_err();
		assert!(matches!(
			err,
			EspError::UnsupportedPayload {
				next_header: NEXT_HEADER_LZO
			}
		));
		assert!(rx.try_recv().is_err());
	}

	#[test_log::test(tokio::test)]
	async fn replayed_sequence_is_dropped() {
		let (mut esp, mut rx) = looped_session();
		let datagram = esp.encrypt(&[1u8; 64], NEXT_HEADER_IP4).unwrap();

		esp.decrypt_and_queue(&datagram).await.unwrap();
		let err = esp.decrypt_and_queue(&datagram).await.unwrap_err();
		assert!(matches!(err, EspError::Replayed { .. }));
		assert_eq!(rx.try_recv().unwrap().data, vec![1u8; 64]);
		assert!(rx.try_recv().is_err());
	}

	#[test]
	fn replay_window_accepts_out_of_order_within_window() {
		let mut window = ReplayWindow::default();
		assert!(window.check_and_update(10));
		assert!(window.check_and_update(8));
		assert!(!window.check_and_update(8));
		assert!(window.check_and_update(11));
		assert!(window.check_and_update(9));
		// 64 behind the highest is outside the window.
		assert!(window.check_and_update(100));
		assert!(!window.check_and_update(36));
		assert!(window.check_and_update(37));
	}

	#[test]
	fn explicit_pad_length_is_honored() {
		// 68 byte payload + pad 10 + trailer 2 = 80, block aligned.
		let (mut esp, _rx) = looped_session();
		let datagram = esp.encrypt(&(0u8..68).collect::<Vec<u8>>(), NEXT_HEADER_IP4).unwrap();
		// ciphertext length: 68 + 10 + 2.
		assert_eq!(datagram.len(), 8 + 16 + 80 + 12);
	}
}
