// Cryptography module: passphrase encryption of credential payloads

pub mod encrypt;

pub use encrypt::{
    decrypt, decrypt_with_key, encrypt, encrypt_with_key, generate_salt, CryptoError, DerivedKey,
};
