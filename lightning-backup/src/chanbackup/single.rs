// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The backup record of a single channel.

use bitcoin::secp256k1::PublicKey;
use bitcoin::OutPoint;

use std::io::{self, Read};

use crate::msgs::{DecodeError, SocketAddress};
use crate::util::ser::{self, FixedLengthReader, Readable, VecWriter, Writeable, Writer};

/// The format version of a [`StaticChannelBackup`], which also tells a restoring node which kind of
/// commitment transaction the channel used.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum SingleBackupVersion {
	/// A channel whose `to_remote` output used a tweaked key.
	Default = 0,
	/// A channel with `option_static_remotekey`.
	Tweakless = 1,
	/// A channel with anchor outputs.
	Anchors = 2,
}

impl SingleBackupVersion {
	fn from_u8(byte: u8) -> Result<Self, DecodeError> {
		match byte {
			0 => Ok(SingleBackupVersion::Default),
			1 => Ok(SingleBackupVersion::Tweakless),
			2 => Ok(SingleBackupVersion::Anchors),
			_ => Err(DecodeError::UnknownVersion),
		}
	}
}

/// The subset of an open channel's state the channel database hands us to build a backup from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenChannel {
	/// The funding transaction output of the channel.
	pub funding_outpoint: OutPoint,
	/// The short channel id, or zero if the channel is not yet confirmed.
	pub short_channel_id: u64,
	/// The node id of our counterparty.
	pub counterparty_node_id: PublicKey,
	/// Whether we opened the channel.
	pub is_outbound: bool,
	/// The total value of the channel.
	pub channel_value_satoshis: u64,
	/// The identifier our signer uses to re-derive the channel's keys.
	pub channel_keys_id: [u8; 32],
	/// The number of blocks our counterparty must wait to claim their funds after a unilateral
	/// close by them.
	pub to_self_delay: u16,
	/// The number of blocks we must wait to claim our funds after a unilateral close by us.
	pub counterparty_to_self_delay: u16,
	/// Whether the channel uses anchor outputs.
	pub anchors: bool,
	/// Whether the channel uses `option_static_remotekey`.
	pub static_remote_key: bool,
}

/// Everything needed to ask a counterparty to force-close a channel and to sweep our funds
/// afterwards, without any of the channel's live state.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct StaticChannelBackup {
	/// The record's format version.
	pub version: SingleBackupVersion,
	/// Whether we opened the channel.
	pub is_initiator: bool,
	/// The funding transaction output, which uniquely identifies the channel.
	pub funding_outpoint: OutPoint,
	/// The short channel id, or zero if the channel was not yet confirmed.
	pub short_channel_id: u64,
	/// The node id of our counterparty.
	pub counterparty_node_id: PublicKey,
	/// The addresses we last knew our counterparty to be reachable at.
	pub addresses: Vec<SocketAddress>,
	/// The total value of the channel.
	pub capacity_sats: u64,
	/// The identifier our signer uses to re-derive the channel's keys.
	pub channel_keys_id: [u8; 32],
	/// See [`OpenChannel::to_self_delay`].
	pub local_to_self_delay: u16,
	/// See [`OpenChannel::counterparty_to_self_delay`].
	pub remote_to_self_delay: u16,
}

impl StaticChannelBackup {
	/// Builds the backup of `channel`, whose counterparty can be reached at `addresses`.
	pub fn new(channel: &OpenChannel, addresses: Vec<SocketAddress>) -> Self {
		let version = if channel.anchors {
			SingleBackupVersion::Anchors
		} else if channel.static_remote_key {
			SingleBackupVersion::Tweakless
		} else {
			SingleBackupVersion::Default
		};
		StaticChannelBackup {
			version,
			is_initiator: channel.is_outbound,
			funding_outpoint: channel.funding_outpoint,
			short_channel_id: channel.short_channel_id,
			counterparty_node_id: channel.counterparty_node_id,
			addresses,
			capacity_sats: channel.channel_value_satoshis,
			channel_keys_id: channel.channel_keys_id,
			local_to_self_delay: channel.to_self_delay,
			remote_to_self_delay: channel.counterparty_to_self_delay,
		}
	}
}

impl Writeable for StaticChannelBackup {
	fn write<W: Writer>(&self, w: &mut W) -> Result<(), io::Error> {
		let mut body = VecWriter(Vec::new());
		self.is_initiator.write(&mut body)?;
		self.funding_outpoint.write(&mut body)?;
		self.short_channel_id.write(&mut body)?;
		self.counterparty_node_id.write(&mut body)?;
		self.capacity_sats.write(&mut body)?;
		self.channel_keys_id.write(&mut body)?;
		self.local_to_self_delay.write(&mut body)?;
		self.remote_to_self_delay.write(&mut body)?;
		let num_addrs: u16 = self.addresses.len().try_into().map_err(|_| {
			io::Error::new(io::ErrorKind::InvalidInput, "too many counterparty addresses")
		})?;
		num_addrs.write(&mut body)?;
		for addr in self.addresses.iter() {
			addr.write(&mut body)?;
		}

		(self.version as u8).write(w)?;
		ser::write_u16_prefixed(w, &body.0)
	}
}

impl Readable for StaticChannelBackup {
	fn read<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
		let version = SingleBackupVersion::from_u8(Readable::read(r)?)?;
		let len: u16 = Readable::read(r)?;
		let mut body = FixedLengthReader::new(r, len as u64);

		let is_initiator = Readable::read(&mut body)?;
		let funding_outpoint = Readable::read(&mut body)?;
		let short_channel_id = Readable::read(&mut body)?;
		let counterparty_node_id = Readable::read(&mut body)?;
		let capacity_sats = Readable::read(&mut body)?;
		let channel_keys_id = Readable::read(&mut body)?;
		let local_to_self_delay = Readable::read(&mut body)?;
		let remote_to_self_delay = Readable::read(&mut body)?;
		let num_addrs: u16 = Readable::read(&mut body)?;
		let mut addresses = Vec::with_capacity(num_addrs as usize);
		for _ in 0..num_addrs {
			addresses.push(Readable::read(&mut body)?);
		}
		// Fields appended by later versions are skipped.
		body.eat_remaining()?;

		Ok(StaticChannelBackup {
			version,
			is_initiator,
			funding_outpoint,
			short_channel_id,
			counterparty_node_id,
			addresses,
			capacity_sats,
			channel_keys_id,
			local_to_self_delay,
			remote_to_self_delay,
		})
	}
}
