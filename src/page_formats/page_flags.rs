//! Byte 0 of every page holds these flag bits. The rest of the byte is
//! reserved and ignored on read.

bitflags! {
    pub struct PageFlags: u8 {
        /// The page belonged to a record that has been removed. Contiguous
        /// runs of deleted pages become free extents on recovery.
        const DELETED = 0b0000_0001;
        /// The page continues a record that starts on an earlier page. A
        /// record reference must never point at one of these.
        const CONTINUATION = 0b0000_0010;
    }
}
