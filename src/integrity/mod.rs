//! Record integrity
//!
//! Checksums cover a record's immutable content only: the checksum itself,
//! sync metadata and each entity's declared mutable fields are excluded, so
//! a checksum changes exactly when the record's logical version does.

mod checksum;

pub use checksum::{
    checksummed_tables, mutable_fields, ChecksumEntry, ChecksumService, ChecksumVerification, IntegrityError,
    IntegrityReport, CHECKSUM_TABLE, MUTABLE_FIELDS,
};
