//! Converts alloy-core `DynSolValue`s into the ledger's field types.
//!
//! Addresses come out lowercase and `0x`-prefixed so that storage is
//! case-stable; integers stay 256-bit.

use alloy_core::dyn_abi::DynSolValue;
use alloy_primitives::{Address, U256};

/// Canonical storage form of an address.
pub fn address_string(address: &Address) -> String {
    format!("{address:#x}")
}

/// Address field, or `None` if `value` is not an address.
pub fn address(value: &DynSolValue) -> Option<Address> {
    match value {
        DynSolValue::Address(a) => Some(*a),
        _ => None,
    }
}

/// Optional owner reference: the zero address means "no account" (mint/burn).
pub fn owner(address: Address) -> Option<String> {
    (!address.is_zero()).then(|| address_string(&address))
}

/// Unsigned integer field of any width.
pub fn uint(value: &DynSolValue) -> Option<U256> {
    match value {
        DynSolValue::Uint(u, _) => Some(*u),
        _ => None,
    }
}

/// String field.
pub fn string(value: &DynSolValue) -> Option<&str> {
    match value {
        DynSolValue::String(s) => Some(s.as_str()),
        _ => None,
    }
}
