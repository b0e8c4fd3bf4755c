// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! CoAP message codes.

use std::fmt;

/// A CoAP code in `class.detail` form, packed the way it appears on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code(u8);

impl Code {
    /// 0.01 GET
    pub const GET: Code = Code::new(0, 1);
    /// 2.04 Changed
    pub const CHANGED: Code = Code::new(2, 4);
    /// 2.05 Content
    pub const CONTENT: Code = Code::new(2, 5);
    /// 4.00 Bad Request
    pub const BAD_REQUEST: Code = Code::new(4, 0);
    /// 4.01 Unauthorized
    pub const UNAUTHORIZED: Code = Code::new(4, 1);
    /// 4.02 Bad Option
    pub const BAD_OPTION: Code = Code::new(4, 2);
    /// 4.04 Not Found
    pub const NOT_FOUND: Code = Code::new(4, 4);
    /// 4.05 Method Not Allowed
    pub const METHOD_NOT_ALLOWED: Code = Code::new(4, 5);
    /// 4.06 Not Acceptable
    pub const NOT_ACCEPTABLE: Code = Code::new(4, 6);
    /// 5.00 Internal Server Error
    pub const INTERNAL_SERVER_ERROR: Code = Code::new(5, 0);

    /// Packs a class/detail pair.
    #[must_use]
    pub const fn new(class: u8, detail: u8) -> Code {
        Code((class & 0x07) << 5 | (detail & 0x1f))
    }

    /// The class part (0 = request, 2 = success, 4/5 = error).
    #[must_use]
    pub const fn class(self) -> u8 {
        self.0 >> 5
    }

    /// The detail part.
    #[must_use]
    pub const fn detail(self) -> u8 {
        self.0 & 0x1f
    }

    /// True for 4.xx and 5.xx codes. Observation values with an error code
    /// carry no payload and are always retained across storing transitions.
    #[must_use]
    pub const fn is_error(self) -> bool {
        self.class() >= 4
    }

    /// The raw on-wire byte.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Code({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_detail_round_trip() {
        assert_eq!(Code::CONTENT.class(), 2);
        assert_eq!(Code::CONTENT.detail(), 5);
        assert_eq!(Code::CONTENT.to_string(), "2.05");
        assert_eq!(Code::CONTENT.as_u8(), 0x45);
    }

    #[test]
    fn error_classes() {
        assert!(!Code::GET.is_error());
        assert!(!Code::CONTENT.is_error());
        assert!(Code::NOT_FOUND.is_error());
        assert!(Code::INTERNAL_SERVER_ERROR.is_error());
    }
}
