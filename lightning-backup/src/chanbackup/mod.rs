// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Backups of our own channels, and of the channels our peers ask us to keep.

pub mod backup_file;
pub mod multi;
pub mod peer_backup;
pub mod peer_multi;
pub mod single;
pub mod sub_swapper;
