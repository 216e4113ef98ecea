//! Re-exports the leaf-script helpers callers need without reaching into `ark-script` directly.

pub use ark_script::script::extract_checksig_pubkeys;
