//! Errno values carried in the `errval` header field.
//!
//! The wire contract uses POSIX errno numbering; re-exported here so server
//! and client code spell them symbolically.

pub use libc::{
    EACCES, EAGAIN, EBADMSG, EBUSY, EEXIST, EIO, ENOENT, ENOMEM, ENOSYS, ENOTCONN, ENOTEMPTY,
    ETIMEDOUT,
};
