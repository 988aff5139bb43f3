// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

#![crate_name = "lightning_backup"]

//! Static channel backups for Lightning nodes.
//!
//! [`chanbackup::sub_swapper::SubSwapper`] keeps an encrypted backup of all of our open channels on
//! disk, atomically swapping it out through [`chanbackup::backup_file::MultiFile`] whenever a
//! channel opens or closes. [`chanbackup::peer_backup::PeerBackup`] and
//! [`peer_storage::KVPeerStorage`] hold the backups our peers ask us to store for them, the latter
//! expiring them a fixed number of blocks after the peer is gone.

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![cfg_attr(not(any(test, feature = "_test_utils")), deny(missing_docs))]
#![cfg_attr(not(any(test, feature = "_test_utils")), forbid(unsafe_code))]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

#[macro_use]
pub mod util;

pub mod chain;
pub mod chanbackup;
pub mod crypto;
pub mod msgs;
pub mod peer_storage;
pub mod sign;
