// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Wire messages and shared wire types used by the backup machinery.
//!
//! [`PeerStorage`] is sent to a peer asking it to hold an opaque blob on our behalf, while
//! [`YourPeerStorage`] is how a peer hands that blob back to us on reconnection. Both carry at
//! most [`MAX_PEER_STORAGE_BYTES`] of data behind a big-endian `u16` length.

use std::fmt;
use std::io::{self, Read};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::util::errors::BackupError;
use crate::util::ser::{Readable, Writeable, Writer};

/// The largest blob a peer storage message may carry. This leaves room for the two byte message
/// type and the two byte length inside the 65535 byte Lightning message limit.
pub const MAX_PEER_STORAGE_BYTES: usize = 65531;

/// An error in decoding a message or struct.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
	/// A version byte specified something we don't know how to handle.
	UnknownVersion,
	/// Value was invalid, eg a byte which was supposed to be a bool was something other than a 0
	/// or 1, a public key was invalid, text wasn't UTF-8, etc
	InvalidValue,
	/// The buffer to be read was too short.
	ShortRead,
	/// A length descriptor in the packet didn't describe the later data correctly.
	BadLengthDescriptor,
	/// Error from [`std::io`].
	Io(io::ErrorKind),
}

impl fmt::Display for DecodeError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			DecodeError::UnknownVersion => f.write_str("Unknown version"),
			DecodeError::InvalidValue => f.write_str("Nonsense bytes didn't map to the type they were interpreted as"),
			DecodeError::ShortRead => f.write_str("Packet extended beyond the provided bytes"),
			DecodeError::BadLengthDescriptor => f.write_str("A length descriptor in the packet didn't describe the later data correctly"),
			DecodeError::Io(ref e) => fmt::Debug::fmt(e, f),
		}
	}
}

impl From<io::Error> for DecodeError {
	fn from(e: io::Error) -> Self {
		if e.kind() == io::ErrorKind::UnexpectedEof {
			DecodeError::ShortRead
		} else {
			DecodeError::Io(e.kind())
		}
	}
}

/// A DNS hostname of at most 255 bytes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hostname(String);

impl Hostname {
	/// Returns the length of the hostname.
	pub fn len(&self) -> u8 {
		(&self.0).len() as u8
	}

	/// Returns the hostname as a string slice.
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for Hostname {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl TryFrom<String> for Hostname {
	type Error = ();

	fn try_from(s: String) -> Result<Self, Self::Error> {
		if s.len() <= 255 && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-') {
			Ok(Hostname(s))
		} else {
			Err(())
		}
	}
}

impl Writeable for Hostname {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		self.len().write(w)?;
		w.write_all(self.0.as_bytes())
	}
}

impl Readable for Hostname {
	fn read<R: Read>(r: &mut R) -> Result<Hostname, DecodeError> {
		let len: u8 = Readable::read(r)?;
		let mut vec = vec![0u8; len as usize];
		r.read_exact(&mut vec)?;
		let s = String::from_utf8(vec).map_err(|_| DecodeError::InvalidValue)?;
		Hostname::try_from(s).map_err(|_| DecodeError::InvalidValue)
	}
}

/// An address which can be used to connect to a remote peer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SocketAddress {
	/// An IPv4 address and port on which the peer is listening.
	TcpIpV4 {
		/// The 4-byte IPv4 address
		addr: [u8; 4],
		/// The port on which the node is listening
		port: u16,
	},
	/// An IPv6 address and port on which the peer is listening.
	TcpIpV6 {
		/// The 16-byte IPv6 address
		addr: [u8; 16],
		/// The port on which the node is listening
		port: u16,
	},
	/// A Tor onion v3 address and port on which the peer is listening.
	///
	/// To create the human-readable "hostname", concatenate `ed25519_pubkey`, `checksum`, and
	/// `version`, wrap as base32 and append ".onion".
	OnionV3 {
		/// The ed25519 long-term public key of the peer
		ed25519_pubkey: [u8; 32],
		/// The checksum of the pubkey and version, as included in the onion address
		checksum: u16,
		/// The version byte, as defined by the Tor Onion v3 spec.
		version: u8,
		/// The port on which the node is listening
		port: u16,
	},
	/// A hostname and port on which the peer is listening.
	Hostname {
		/// The hostname on which the node is listening.
		hostname: Hostname,
		/// The port on which the node is listening.
		port: u16,
	},
}

impl SocketAddress {
	fn get_id(&self) -> u8 {
		match self {
			&SocketAddress::TcpIpV4 { .. } => 1,
			&SocketAddress::TcpIpV6 { .. } => 2,
			&SocketAddress::OnionV3 { .. } => 4,
			&SocketAddress::Hostname { .. } => 5,
		}
	}
}

impl Writeable for SocketAddress {
	fn write<W: Writer>(&self, writer: &mut W) -> Result<(), io::Error> {
		self.get_id().write(writer)?;
		match self {
			&SocketAddress::TcpIpV4 { ref addr, ref port } => {
				addr.write(writer)?;
				port.write(writer)?;
			},
			&SocketAddress::TcpIpV6 { ref addr, ref port } => {
				addr.write(writer)?;
				port.write(writer)?;
			},
			&SocketAddress::OnionV3 { ref ed25519_pubkey, ref checksum, ref version, ref port } => {
				ed25519_pubkey.write(writer)?;
				checksum.write(writer)?;
				version.write(writer)?;
				port.write(writer)?;
			},
			&SocketAddress::Hostname { ref hostname, ref port } => {
				hostname.write(writer)?;
				port.write(writer)?;
			},
		}
		Ok(())
	}
}

impl Readable for SocketAddress {
	fn read<R: Read>(reader: &mut R) -> Result<SocketAddress, DecodeError> {
		let byte: u8 = Readable::read(reader)?;
		match byte {
			1 => Ok(SocketAddress::TcpIpV4 {
				addr: Readable::read(reader)?,
				port: Readable::read(reader)?,
			}),
			2 => Ok(SocketAddress::TcpIpV6 {
				addr: Readable::read(reader)?,
				port: Readable::read(reader)?,
			}),
			4 => Ok(SocketAddress::OnionV3 {
				ed25519_pubkey: Readable::read(reader)?,
				checksum: Readable::read(reader)?,
				version: Readable::read(reader)?,
				port: Readable::read(reader)?,
			}),
			5 => Ok(SocketAddress::Hostname {
				hostname: Readable::read(reader)?,
				port: Readable::read(reader)?,
			}),
			_ => Err(DecodeError::InvalidValue),
		}
	}
}

impl From<SocketAddr> for SocketAddress {
	fn from(addr: SocketAddr) -> Self {
		match addr {
			SocketAddr::V4(addr) => {
				SocketAddress::TcpIpV4 { addr: addr.ip().octets(), port: addr.port() }
			},
			SocketAddr::V6(addr) => {
				SocketAddress::TcpIpV6 { addr: addr.ip().octets(), port: addr.port() }
			},
		}
	}
}

impl fmt::Display for SocketAddress {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			SocketAddress::TcpIpV4 { addr, port } => {
				let socket_addr = SocketAddrV4::new(Ipv4Addr::from(*addr), *port);
				write!(f, "{}", socket_addr)
			},
			SocketAddress::TcpIpV6 { addr, port } => {
				let socket_addr = SocketAddrV6::new(Ipv6Addr::from(*addr), *port, 0, 0);
				write!(f, "{}", socket_addr)
			},
			SocketAddress::OnionV3 { ed25519_pubkey, port, .. } => {
				write!(f, "onion:")?;
				for b in ed25519_pubkey.iter() {
					write!(f, "{:02x}", b)?;
				}
				write!(f, ":{}", port)
			},
			SocketAddress::Hostname { hostname, port } => write!(f, "{}:{}", hostname, port),
		}
	}
}

fn write_peer_storage_blob<W: Writer>(data: &[u8], w: &mut W) -> Result<(), io::Error> {
	if data.len() > MAX_PEER_STORAGE_BYTES {
		return Err(io::Error::new(io::ErrorKind::InvalidInput, "peer storage blob too large"));
	}
	(data.len() as u16).write(w)?;
	w.write_all(data)
}

fn read_peer_storage_blob<R: Read>(r: &mut R) -> Result<Vec<u8>, DecodeError> {
	let len: u16 = Readable::read(r)?;
	if len as usize > MAX_PEER_STORAGE_BYTES {
		return Err(DecodeError::BadLengthDescriptor);
	}
	let mut data = vec![0u8; len as usize];
	r.read_exact(&mut data)?;
	Ok(data)
}

/// A `peer_storage` message, sent to a peer to ask it to store `data` on our behalf.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PeerStorage {
	data: Vec<u8>,
}

impl PeerStorage {
	/// The wire message type of `peer_storage`.
	pub const TYPE: u16 = 7;

	/// Wraps `data`, failing if it is larger than [`MAX_PEER_STORAGE_BYTES`].
	pub fn new(data: Vec<u8>) -> Result<Self, BackupError> {
		if data.len() > MAX_PEER_STORAGE_BYTES {
			return Err(BackupError::PeerStorageBytesExceeded { size: data.len() });
		}
		Ok(PeerStorage { data })
	}

	/// The blob the peer is asked to store.
	pub fn data(&self) -> &[u8] {
		&self.data
	}

	/// Consumes the message, returning the stored blob.
	pub fn into_data(self) -> Vec<u8> {
		self.data
	}
}

impl Writeable for PeerStorage {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		write_peer_storage_blob(&self.data, w)
	}
}

impl Readable for PeerStorage {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(PeerStorage { data: read_peer_storage_blob(r)? })
	}
}

/// A `your_peer_storage` message, returning to a peer the blob it previously asked us to store.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct YourPeerStorage {
	data: Vec<u8>,
}

impl YourPeerStorage {
	/// The wire message type of `your_peer_storage`.
	pub const TYPE: u16 = 9;

	/// Wraps `data`, failing if it is larger than [`MAX_PEER_STORAGE_BYTES`].
	pub fn new(data: Vec<u8>) -> Result<Self, BackupError> {
		if data.len() > MAX_PEER_STORAGE_BYTES {
			return Err(BackupError::PeerStorageBytesExceeded { size: data.len() });
		}
		Ok(YourPeerStorage { data })
	}

	/// The blob being returned.
	pub fn data(&self) -> &[u8] {
		&self.data
	}

	/// Consumes the message, returning the stored blob.
	pub fn into_data(self) -> Vec<u8> {
		self.data
	}
}

impl Writeable for YourPeerStorage {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		write_peer_storage_blob(&self.data, w)
	}
}

impl Readable for YourPeerStorage {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		Ok(YourPeerStorage { data: read_peer_storage_blob(r)? })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn peer_storage_encoding() {
		let msg = PeerStorage::new(vec![0xab; 3]).unwrap();
		let encoded = msg.encode().unwrap();
		assert_eq!(encoded, vec![0, 3, 0xab, 0xab, 0xab]);
		let decoded: PeerStorage = Readable::read(&mut &encoded[..]).unwrap();
		assert_eq!(decoded, msg);
	}

	#[test]
	fn peer_storage_size_limit() {
		let max = PeerStorage::new(vec![1; MAX_PEER_STORAGE_BYTES]).unwrap();
		let encoded = max.encode().unwrap();
		assert_eq!(encoded.len(), MAX_PEER_STORAGE_BYTES + 2);
		assert_eq!(&encoded[..2], &[0xff, 0xfb]);

		match YourPeerStorage::new(vec![1; MAX_PEER_STORAGE_BYTES + 1]) {
			Err(BackupError::PeerStorageBytesExceeded { size }) => {
				assert_eq!(size, MAX_PEER_STORAGE_BYTES + 1)
			},
			_ => panic!(),
		}
	}

	#[test]
	fn oversized_length_rejected_on_read() {
		let mut encoded = vec![0xff, 0xfc];
		encoded.extend_from_slice(&[0u8; MAX_PEER_STORAGE_BYTES + 1]);
		let res: Result<YourPeerStorage, _> = Readable::read(&mut &encoded[..]);
		assert_eq!(res, Err(DecodeError::BadLengthDescriptor));

		let res: Result<YourPeerStorage, _> = Readable::read(&mut &[0u8, 4, 1, 2][..]);
		assert_eq!(res, Err(DecodeError::ShortRead));
	}

	#[test]
	fn empty_blob() {
		let msg = YourPeerStorage::new(Vec::new()).unwrap();
		assert_eq!(msg.encode().unwrap(), vec![0, 0]);
		let decoded: YourPeerStorage = Readable::read(&mut &[0u8, 0][..]).unwrap();
		assert!(decoded.data().is_empty());
	}

	#[test]
	fn socket_address_encoding() {
		let addr = SocketAddress::from("127.0.0.1:9735".parse::<SocketAddr>().unwrap());
		assert_eq!(addr, SocketAddress::TcpIpV4 { addr: [127, 0, 0, 1], port: 9735 });
		assert_eq!(addr.to_string(), "127.0.0.1:9735");
		assert_eq!(addr.encode().unwrap(), vec![1, 127, 0, 0, 1, 0x26, 0x07]);

		let hostname = Hostname::try_from("node.example.com".to_owned()).unwrap();
		let addr = SocketAddress::Hostname { hostname, port: 9735 };
		let encoded = addr.encode().unwrap();
		assert_eq!(encoded[0], 5);
		assert_eq!(encoded[1], 16);
		let decoded: SocketAddress = Readable::read(&mut &encoded[..]).unwrap();
		assert_eq!(decoded, addr);

		let res: Result<SocketAddress, _> = Readable::read(&mut &[9u8, 0, 0][..]);
		assert_eq!(res, Err(DecodeError::InvalidValue));
	}

	#[test]
	fn hostname_validation() {
		assert!(Hostname::try_from("a b".to_owned()).is_err());
		assert!(Hostname::try_from("a".repeat(256)).is_err());
		assert!(Hostname::try_from("a".repeat(255)).is_ok());
	}
}
