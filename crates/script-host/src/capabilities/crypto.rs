//! The `crypt` library
//!
//! Digests and MACs return lowercase hex. `generatebytes` returns raw bytes,
//! `generatekey` a base64 key.

use mlua::{Function, Lua, MultiValue, Value};
use tether_engine_core::crypto::{self, HashAlgorithm};
use tether_engine_core::AdapterLifecycle;

use crate::bindings::{arg_bytes, arg_integer, arg_string, nil_with, ok_or_nil};
use crate::{Capability, InstallContext};

pub struct CryptoLib {
    lifecycle: AdapterLifecycle,
}

impl CryptoLib {
    pub fn new() -> Self {
        Self {
            lifecycle: AdapterLifecycle::new("crypto"),
        }
    }
}

impl Default for CryptoLib {
    fn default() -> Self {
        Self::new()
    }
}

/// One-argument function over bytes that returns bytes
fn bytes_fn<F>(lua: &Lua, f: F) -> mlua::Result<Function>
where
    F: Fn(&[u8]) -> Result<Vec<u8>, String> + 'static,
{
    lua.create_function(move |lua, data: Value| {
        match arg_bytes(&data, "data").and_then(|data| f(&data)) {
            Ok(out) => Ok(MultiValue::from_vec(vec![Value::String(lua.create_string(out)?)])),
            Err(e) => nil_with(lua, e),
        }
    })
}

fn digest_fn(lua: &Lua, algorithm: HashAlgorithm) -> mlua::Result<Function> {
    bytes_fn(lua, move |data| Ok(crypto::digest_hex(algorithm, data).into_bytes()))
}

/// Optional algorithm argument, SHA-256 when absent
fn algorithm(value: &Value) -> Result<HashAlgorithm, String> {
    match value {
        Value::Nil => Ok(HashAlgorithm::Sha256),
        other => arg_string(other, "algorithm")
            .and_then(|name| HashAlgorithm::parse(&name).map_err(|e| e.to_string())),
    }
}

impl Capability for CryptoLib {
    fn name(&self) -> &'static str {
        "crypto"
    }

    fn install(&self, lua: &Lua, _ctx: &InstallContext) -> mlua::Result<()> {
        let crypt = lua.create_table()?;

        crypt.set("sha256", digest_fn(lua, HashAlgorithm::Sha256)?)?;
        crypt.set("sha384", digest_fn(lua, HashAlgorithm::Sha384)?)?;
        crypt.set("sha512", digest_fn(lua, HashAlgorithm::Sha512)?)?;
        crypt.set("md5", digest_fn(lua, HashAlgorithm::Md5)?)?;

        crypt.set(
            "hash",
            lua.create_function(|lua, (data, alg): (Value, Value)| {
                let result = arg_bytes(&data, "data")
                    .and_then(|data| Ok(crypto::digest_hex(algorithm(&alg)?, &data)));
                ok_or_nil(lua, result)
            })?,
        )?;

        crypt.set(
            "hmac",
            lua.create_function(|lua, (data, key, alg): (Value, Value, Value)| {
                let result = (|| {
                    let data = arg_bytes(&data, "data")?;
                    let key = arg_bytes(&key, "key")?;
                    let mac = crypto::hmac(algorithm(&alg)?, &key, &data).map_err(|e| e.to_string())?;
                    Ok::<_, String>(crypto::hex_encode(&mac))
                })();
                ok_or_nil(lua, result)
            })?,
        )?;

        let b64_encode = bytes_fn(lua, |data| Ok(crypto::base64_encode(data).into_bytes()))?;
        let b64_decode = bytes_fn(lua, |data| {
            std::str::from_utf8(data)
                .map_err(|_| "base64 input is not text".to_string())
                .and_then(|text| crypto::base64_decode(text).map_err(|e| e.to_string()))
        })?;
        let hex_encode = bytes_fn(lua, |data| Ok(crypto::hex_encode(data).into_bytes()))?;
        let hex_decode = bytes_fn(lua, |data| {
            std::str::from_utf8(data)
                .map_err(|_| "hex input is not text".to_string())
                .and_then(|text| crypto::hex_decode(text).map_err(|e| e.to_string()))
        })?;

        crypt.set("base64encode", b64_encode.clone())?;
        crypt.set("base64_encode", b64_encode.clone())?;
        crypt.set("base64decode", b64_decode.clone())?;
        crypt.set("base64_decode", b64_decode.clone())?;
        crypt.set("hexencode", hex_encode)?;
        crypt.set("hexdecode", hex_decode)?;

        crypt.set(
            "generatebytes",
            lua.create_function(|lua, count: Value| {
                match arg_integer(&count, "count")
                    .and_then(|n| crypto::random_bytes(n).map_err(|e| e.to_string()))
                {
                    Ok(bytes) => Ok(MultiValue::from_vec(vec![Value::String(
                        lua.create_string(bytes)?,
                    )])),
                    Err(e) => nil_with(lua, e),
                }
            })?,
        )?;
        crypt.set(
            "generatekey",
            lua.create_function(|_, ()| Ok(crypto::generate_key()))?,
        )?;
        crypt.set(
            "random",
            lua.create_function(|lua, (min, max): (Value, Value)| {
                let bound = |value: &Value, name, default| match value {
                    Value::Nil => Ok(default),
                    other => arg_integer(other, name),
                };
                let result = bound(&min, "min", 0)
                    .and_then(|min| Ok(crypto::random_int(min, bound(&max, "max", i64::from(i32::MAX))?)));
                ok_or_nil(lua, result)
            })?,
        )?;

        let globals = lua.globals();
        globals.set("crypt", crypt.clone())?;
        globals.set("crypto", crypt)?;
        globals.set("base64encode", b64_encode)?;
        globals.set("base64decode", b64_decode)?;

        self.lifecycle.activate();
        Ok(())
    }

    fn lifecycle(&self) -> &AdapterLifecycle {
        &self.lifecycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::{eval, session_with};

    #[test]
    fn digests_are_hex() {
        let session = session_with(Box::new(CryptoLib::new()));
        let (sha, md5, named): (String, String, String) = eval(
            &session,
            "return crypt.sha256('abc'), crypt.md5(''), crypt.hash('abc', 'SHA256')",
        );
        assert_eq!(
            sha,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(md5, "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(named, sha);
    }

    #[test]
    fn hmac_defaults_to_sha256() {
        let session = session_with(Box::new(CryptoLib::new()));
        let (mac, explicit): (String, String) = eval(
            &session,
            "return crypt.hmac('The quick brown fox jumps over the lazy dog', 'key'), \
             crypt.hmac('The quick brown fox jumps over the lazy dog', 'key', 'sha256')",
        );
        assert_eq!(
            mac,
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
        assert_eq!(mac, explicit);
    }

    #[test]
    fn encodings_round_trip_and_alias() {
        let session = session_with(Box::new(CryptoLib::new()));
        let (b64, back, hex, same): (String, String, String, bool) = eval(
            &session,
            "local e = base64encode('hello') \
             return e, crypt.base64_decode(e), crypt.hexencode('hi'), crypto == crypt",
        );
        assert_eq!(b64, "aGVsbG8=");
        assert_eq!(back, "hello");
        assert_eq!(hex, "6869");
        assert!(same);
    }

    #[test]
    fn failures_return_nil_and_message() {
        let session = session_with(Box::new(CryptoLib::new()));
        let (value, message): (Value, String) =
            eval(&session, "return crypt.hash('x', 'whirlpool')");
        assert!(value.is_nil());
        assert!(message.contains("whirlpool"));

        let (value, message): (Value, String) = eval(&session, "return crypt.hexdecode('zz')");
        assert!(value.is_nil());
        assert!(!message.is_empty());

        let (value, _): (Value, String) = eval(&session, "return crypt.generatebytes(0)");
        assert!(value.is_nil());
    }

    #[test]
    fn random_material() {
        let session = session_with(Box::new(CryptoLib::new()));
        let (len, key_len, n): (i64, i64, i64) = eval(
            &session,
            "return #crypt.generatebytes(16), #crypt.base64decode(crypt.generatekey()), crypt.random(5, 5)",
        );
        assert_eq!(len, 16);
        assert_eq!(key_len, 32);
        assert_eq!(n, 5);
    }
}
