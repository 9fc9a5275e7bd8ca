//! Standard Security Handler (V=2, R=3): password padding, the file key
//! derivation, /O and /U computation, and per-object RC4 keying.

use crate::error::*;
use crate::object::{Dictionary, NodeId, PlainRef, Primitive};

use bitflags::bitflags;
use rand::RngCore;
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;

pub const PADDING: [u8; 32] = [
    0x28, 0xBF, 0x4E, 0x5E, 0x4E, 0x75, 0x8A, 0x41,
    0x64, 0x00, 0x4E, 0x56, 0xFF, 0xFA, 0x01, 0x08,
    0x2E, 0x2E, 0x00, 0xB6, 0xD0, 0x68, 0x3E, 0x80,
    0x2F, 0x0C, 0xA9, 0xFE, 0x64, 0x53, 0x69, 0x7A,
];

#[derive(Copy)]
pub struct Rc4 {
    i: u8,
    j: u8,
    state: [u8; 256],
}

impl Clone for Rc4 {
    fn clone(&self) -> Rc4 {
        *self
    }
}

impl Rc4 {
    pub fn new(key: &[u8]) -> Rc4 {
        assert!(!key.is_empty() && key.len() <= 256);
        let mut rc4 = Rc4 { i: 0, j: 0, state: [0; 256] };
        for (i, x) in rc4.state.iter_mut().enumerate() {
            *x = i as u8;
        }
        let mut j: u8 = 0;
        for i in 0..256 {
            j = j.wrapping_add(rc4.state[i]).wrapping_add(key[i % key.len()]);
            rc4.state.swap(i, j as usize);
        }
        rc4
    }
    fn next(&mut self) -> u8 {
        self.i = self.i.wrapping_add(1);
        self.j = self.j.wrapping_add(self.state[self.i as usize]);
        self.state.swap(self.i as usize, self.j as usize);
        self.state[(self.state[self.i as usize].wrapping_add(self.state[self.j as usize])) as usize]
    }
    /// RC4 is symmetric: the same call decrypts.
    pub fn encrypt(key: &[u8], data: &mut [u8]) {
        let mut rc4 = Rc4::new(key);
        for b in data.iter_mut() {
            *b ^= rc4.next();
        }
    }
    pub fn encrypt_to_vec(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        Rc4::encrypt(key, &mut out);
        out
    }
}

bitflags! {
    /// User access permission flags (table 22 of the PDF reference).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessPermissions: u32 {
        const PRINT = 1 << 2;
        const MODIFY = 1 << 3;
        const EXTRACT_GRAPHICS = 1 << 4;
        const ANNOTATE = 1 << 5;
        const FILL_FORMS = 1 << 8;
        const EXTRACT = 1 << 9;
        const ASSEMBLE = 1 << 10;
        const PRINT_FAITHFUL = 1 << 11;
    }
}

impl AccessPermissions {
    /// The signed `/P` value. Bits outside the defined flag set are required
    /// to be 1, so granting everything yields -1.
    pub fn get_p(self) -> i32 {
        (self.bits() | !AccessPermissions::all().bits()) as i32
    }
}

impl Default for AccessPermissions {
    fn default() -> AccessPermissions {
        AccessPermissions::all()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EncryptOptions {
    pub permissions: AccessPermissions,
}

/// Truncate to 32 bytes and right-pad with the standard padding string.
fn pad_password(pass: &[u8]) -> [u8; 32] {
    let mut padded = [0; 32];
    let n = pass.len().min(32);
    padded[..n].copy_from_slice(&pass[..n]);
    padded[n..].copy_from_slice(&PADDING[..32 - n]);
    padded
}

/// `id0 = MD5(timestamp)`, `id1 = MD5(100 random bytes)`.
pub fn generate_file_id(now: chrono::DateTime<chrono::Local>) -> (Vec<u8>, Vec<u8>) {
    // RFC 850 format, e.g. "Monday, 02-Jan-06 15:04:05 +0000"
    let stamp = now.format("%A, %d-%b-%y %H:%M:%S %z").to_string();
    let id0 = md5::compute(stamp.as_bytes()).0.to_vec();

    let mut noise = [0u8; 100];
    rand::thread_rng().fill_bytes(&mut noise);
    let id1 = md5::compute(noise).0.to_vec();
    (id0, id1)
}

/// The Standard Security Handler state shared by reader and writer.
///
/// On the read side it is constructed from the `/Encrypt` dictionary and
/// authenticated against a password; on the write side it is constructed
/// from passwords and computes `/O` and `/U` itself.
pub struct Crypter {
    key: [u8; 16],
    key_size: usize,
    pub o: Vec<u8>,
    pub u: Vec<u8>,
    pub p: i32,
    pub bits: u32,
    id0: Vec<u8>,
    pub authenticated: bool,
    /// Strings inside the /Encrypt dictionary itself are never encrypted.
    pub encrypt_ref: Option<PlainRef>,
    crypted: RefCell<HashSet<NodeId>>,
}

impl Crypter {
    /// Read side: captures the parameters, authenticates later.
    pub fn from_dict(dict: &Dictionary, id0: Vec<u8>) -> Result<Crypter> {
        if let Some(filter) = dict.get("Filter") {
            let filter = filter.as_name()?;
            if filter != "Standard" {
                err!(PdfError::UnsupportedEncryption {
                    msg: format!("security handler /{}", filter),
                });
            }
        }
        let v = dict.require("Encrypt", "V")?.as_integer()?;
        let r = dict.require("Encrypt", "R")?.as_integer()?;
        if v != 2 || r != 3 {
            err!(PdfError::UnsupportedEncryption {
                msg: format!("V={} R={} (only V=2 R=3 is supported)", v, r),
            });
        }
        let bits = match dict.get("Length") {
            Some(p) => p.as_integer()? as u32,
            None => 40,
        };
        if bits % 8 != 0 || !(40..=128).contains(&bits) {
            err!(PdfError::UnsupportedEncryption {
                msg: format!("key length {}", bits),
            });
        }
        let o = dict.require("Encrypt", "O")?.as_string()?.as_bytes().to_vec();
        let u = dict.require("Encrypt", "U")?.as_string()?.as_bytes().to_vec();
        let p = dict.require("Encrypt", "P")?.as_integer()? as i32;

        Ok(Crypter {
            key: [0; 16],
            key_size: bits as usize / 8,
            o,
            u,
            p,
            bits,
            id0,
            authenticated: false,
            encrypt_ref: None,
            crypted: RefCell::new(HashSet::new()),
        })
    }

    /// Write side: derive /O, the file key and /U from the passwords.
    pub fn for_writing(user_pw: &[u8], owner_pw: &[u8], p: i32, id0: Vec<u8>) -> Crypter {
        let o = compute_o(owner_pw, user_pw);
        let mut crypter = Crypter {
            key: [0; 16],
            key_size: 16,
            o,
            u: Vec::new(),
            p,
            bits: 128,
            id0,
            authenticated: true,
            encrypt_ref: None,
            crypted: RefCell::new(HashSet::new()),
        };
        crypter.key = crypter.compute_file_key(&pad_password(user_pw));
        crypter.u = crypter.compute_u();
        crypter
    }

    fn key(&self) -> &[u8] {
        &self.key[..self.key_size]
    }

    /// 7.6.3.3 Algorithm 2: the file encryption key.
    fn compute_file_key(&self, padded_pass: &[u8; 32]) -> [u8; 16] {
        let mut hash = md5::Context::new();
        hash.consume(padded_pass);
        hash.consume(&self.o);
        hash.consume(self.p.to_le_bytes());
        hash.consume(&self.id0);
        let mut data = hash.compute().0;
        for _ in 0..50 {
            data = md5::compute(&data[..self.key_size]).0;
        }
        data
    }

    /// 7.6.3.4 Algorithm 5 (R=3): the /U value for a candidate key.
    fn compute_u_with(&self, key: &[u8]) -> Vec<u8> {
        let mut hash = md5::Context::new();
        hash.consume(PADDING);
        hash.consume(&self.id0);
        let mut data = hash.compute().0;

        Rc4::encrypt(key, &mut data);
        for i in 1u8..=19 {
            let xored: Vec<u8> = key.iter().map(|&b| b ^ i).collect();
            Rc4::encrypt(&xored, &mut data);
        }
        let mut out = data.to_vec();
        out.resize(32, 0);
        out
    }

    fn compute_u(&self) -> Vec<u8> {
        self.compute_u_with(self.key())
    }

    fn check_u(&self, key: &[u8]) -> bool {
        self.u.len() >= 16 && self.compute_u_with(key)[..16] == self.u[..16]
    }

    /// Try `pass` first as the user password, then as the owner password.
    /// On success the file key is stored and the crypter is authenticated.
    pub fn authenticate(&mut self, pass: &[u8]) -> bool {
        let key = self.compute_file_key(&pad_password(pass));
        if self.check_u(&key[..self.key_size]) {
            self.key = key;
            self.authenticated = true;
            return true;
        }

        // Owner password: undo the 20 RC4 rounds over /O to recover the
        // padded user password, then authenticate with that.
        let mut hash = md5::compute(pad_password(pass)).0;
        for _ in 0..50 {
            hash = md5::compute(hash).0;
        }
        let okey = &hash[..16];
        let mut user_pass = self.o.clone();
        for i in (0u8..=19).rev() {
            let xored: Vec<u8> = okey.iter().map(|&b| b ^ i).collect();
            Rc4::encrypt(&xored, &mut user_pass);
        }
        if user_pass.len() == 32 {
            let mut padded = [0; 32];
            padded.copy_from_slice(&user_pass);
            let key = self.compute_file_key(&padded);
            if self.check_u(&key[..self.key_size]) {
                self.key = key;
                self.authenticated = true;
                return true;
            }
        }
        false
    }

    /// The RC4 key for object `r`: MD5 over the file key followed by the low
    /// three bytes of the object number and the low two of the generation.
    fn object_key(&self, r: PlainRef) -> ([u8; 16], usize) {
        let n = self.key_size;
        let mut input = Vec::with_capacity(n + 5);
        input.extend_from_slice(self.key());
        input.extend_from_slice(&r.id.to_le_bytes()[..3]);
        input.extend_from_slice(&r.gen.to_le_bytes()[..2]);
        (md5::compute(&input).0, (n + 5).min(16))
    }

    fn is_encrypt_dict(&self, r: PlainRef) -> bool {
        self.encrypt_ref.map(|e| e.id == r.id) == Some(true)
    }

    /// Decrypt every string nested in a freshly parsed object.
    pub fn decrypt_strings(&self, r: PlainRef, p: &mut Primitive) {
        if self.is_encrypt_dict(r) {
            return;
        }
        let (key, n) = self.object_key(r);
        apply_to_strings(&key[..n], p);
    }

    /// Decrypt the strings of a stream dictionary and its payload.
    pub fn decrypt_stream(&self, r: PlainRef, dict: &mut Dictionary, data: &mut [u8]) {
        let (key, n) = self.object_key(r);
        for (_, value) in dict.iter_mut() {
            apply_to_strings(&key[..n], value);
        }
        Rc4::encrypt(&key[..n], data);
    }

    /// Encrypt an object in place ahead of emission. Nested indirect objects
    /// and streams are separate objects with their own keys and are skipped;
    /// each node is transformed at most once.
    pub fn encrypt_object(&self, object: &Primitive) {
        match object {
            Primitive::Indirect(obj) => {
                if self.is_encrypt_dict(obj.id()) || !self.crypted.borrow_mut().insert(obj.node_id()) {
                    return;
                }
                let (key, n) = self.object_key(obj.id());
                apply_to_strings(&key[..n], &mut obj.inner.borrow_mut());
            }
            Primitive::Stream(stm) => {
                if !self.crypted.borrow_mut().insert(stm.node_id()) {
                    return;
                }
                let (key, n) = self.object_key(stm.id());
                for (_, value) in stm.dict.borrow_mut().iter_mut() {
                    apply_to_strings(&key[..n], value);
                }
                Rc4::encrypt(&key[..n], &mut stm.data.borrow_mut());
            }
            _ => {}
        }
    }
}

/// 7.6.3.4 Algorithm 3: the /O value. An empty owner password falls back to
/// the user password.
fn compute_o(owner_pw: &[u8], user_pw: &[u8]) -> Vec<u8> {
    let padded_owner = if owner_pw.is_empty() {
        pad_password(user_pw)
    } else {
        pad_password(owner_pw)
    };
    let mut hash = md5::compute(padded_owner).0;
    for _ in 0..50 {
        hash = md5::compute(hash).0;
    }
    let key = &hash[..16];

    let mut out = pad_password(user_pw).to_vec();
    Rc4::encrypt(key, &mut out);
    for i in 1u8..=19 {
        let xored: Vec<u8> = key.iter().map(|&b| b ^ i).collect();
        Rc4::encrypt(&xored, &mut out);
    }
    out
}

/// RC4 every string nested in `p`. Stops at references and at nodes with
/// their own identity.
fn apply_to_strings(key: &[u8], p: &mut Primitive) {
    match p {
        Primitive::String(s) => Rc4::encrypt(key, &mut s.data),
        Primitive::Array(items) => {
            for item in items {
                apply_to_strings(key, item);
            }
        }
        Primitive::Dictionary(dict) => {
            for (_, value) in dict.iter_mut() {
                apply_to_strings(key, value);
            }
        }
        _ => {}
    }
}

impl fmt::Debug for Crypter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Crypter")
            .field("bits", &self.bits)
            .field("p", &self.p)
            .field("authenticated", &self.authenticated)
            .finish()
    }
}
