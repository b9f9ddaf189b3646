//! Hand-assembled Wasm fixtures used by the sandbox tests.
//!
//! Each builder returns a complete, valid module encoded byte by byte so the
//! tests need no guest toolchain.  The section layouts follow the binary
//! format: magic + version, then type (1), import (2), function (3),
//! memory (5), export (7) and code (10) sections as needed.
//!
//! The misbehaving fixtures only misbehave when dispatched the job hook
//! (discriminant 4); every other hook returns 0 so the load handshake
//! succeeds first.

/// `local.get 0; i32.const 4; i32.ne; if { i32.const 0; return }` -- the
/// guard prefix that returns 0 early for every hook except the job hook.
const JOB_ONLY_GUARD: [u8; 11] = [
    0x20, 0x00, 0x41, 0x04, 0x47, 0x04, 0x40, 0x41, 0x00, 0x0F, 0x0B,
];

/// Smallest valid module: header only, no sections.
pub fn minimal() -> Vec<u8> {
    vec![0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00]
}

fn push_section(m: &mut Vec<u8>, id: u8, payload: &[u8]) {
    m.push(id);
    m.push(payload.len() as u8);
    m.extend_from_slice(payload);
}

fn push_code_section(m: &mut Vec<u8>, body: &[u8]) {
    let mut payload = vec![0x01, (body.len() + 1) as u8, 0x00];
    payload.extend_from_slice(body);
    push_section(m, 0x0A, &payload);
}

fn handle_hook_export(func_index: u8) -> Vec<u8> {
    let mut payload = vec![0x01, 0x0B];
    payload.extend_from_slice(b"handle_hook");
    payload.extend_from_slice(&[0x00, func_index]);
    payload
}

/// Exports `handle_hook` that spins forever on the job hook, burning fuel
/// until a ceiling fires.
pub fn infinite_loop() -> Vec<u8> {
    let mut m = minimal();
    // type 0: (i32, i32, i32) -> i32
    push_section(&mut m, 0x01, &[0x01, 0x60, 0x03, 0x7F, 0x7F, 0x7F, 0x01, 0x7F]);
    // one func of type 0
    push_section(&mut m, 0x03, &[0x01, 0x00]);
    push_section(&mut m, 0x07, &handle_hook_export(0));
    // guard; loop(void) br 0 end; unreachable
    let mut body = JOB_ONLY_GUARD.to_vec();
    body.extend_from_slice(&[0x03, 0x40, 0x0C, 0x00, 0x0B, 0x00, 0x0B]);
    push_code_section(&mut m, &body);
    m
}

/// Exports a one-page memory and a `handle_hook` that, on the job hook,
/// grows it by 1000 pages (~64 MiB) in one step, tripping any reasonable
/// heap ceiling.
pub fn memory_hog() -> Vec<u8> {
    let mut m = minimal();
    push_section(&mut m, 0x01, &[0x01, 0x60, 0x03, 0x7F, 0x7F, 0x7F, 0x01, 0x7F]);
    push_section(&mut m, 0x03, &[0x01, 0x00]);
    // memory: min 1 page, no max
    push_section(&mut m, 0x05, &[0x01, 0x00, 0x01]);
    // exports: "memory" -> mem 0, plus handle_hook
    let mut exports = vec![0x02, 0x06];
    exports.extend_from_slice(b"memory");
    exports.extend_from_slice(&[0x02, 0x00, 0x0B]);
    exports.extend_from_slice(b"handle_hook");
    exports.extend_from_slice(&[0x00, 0x00]);
    push_section(&mut m, 0x07, &exports);
    // guard; i32.const 1000; memory.grow; drop; i32.const 0
    let mut body = JOB_ONLY_GUARD.to_vec();
    body.extend_from_slice(&[0x41, 0xE8, 0x07, 0x40, 0x00, 0x1A, 0x41, 0x00, 0x0B]);
    push_code_section(&mut m, &body);
    m
}

/// Exports a `handle_hook` that, on the job hook, calls the named
/// two-argument `plugbay` host import with (0, 0) and returns its result.
fn call_host_import(name: &[u8]) -> Vec<u8> {
    let mut m = minimal();
    // types: 0 = (i32, i32) -> i32 for the import, 1 = (i32, i32, i32) -> i32
    push_section(
        &mut m,
        0x01,
        &[
            0x02, 0x60, 0x02, 0x7F, 0x7F, 0x01, 0x7F, 0x60, 0x03, 0x7F, 0x7F, 0x7F, 0x01, 0x7F,
        ],
    );
    // import "plugbay"::<name> as func of type 0
    let mut imports = vec![0x01, 0x07];
    imports.extend_from_slice(b"plugbay");
    imports.push(name.len() as u8);
    imports.extend_from_slice(name);
    imports.extend_from_slice(&[0x00, 0x00]);
    push_section(&mut m, 0x02, &imports);
    // one local func of type 1; the import is func 0, so it exports func 1
    push_section(&mut m, 0x03, &[0x01, 0x01]);
    push_section(&mut m, 0x07, &handle_hook_export(1));
    // guard; i32.const 0; i32.const 0; call 0
    let mut body = JOB_ONLY_GUARD.to_vec();
    body.extend_from_slice(&[0x41, 0x00, 0x41, 0x00, 0x10, 0x00, 0x0B]);
    push_code_section(&mut m, &body);
    m
}

/// `handle_hook` attempts dynamic code evaluation on the job hook.
pub fn call_host_eval() -> Vec<u8> {
    call_host_import(b"host_eval")
}

/// `handle_hook` attempts to spawn a subprocess on the job hook.
pub fn call_host_spawn() -> Vec<u8> {
    call_host_import(b"host_spawn")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixtures_carry_the_wasm_magic() {
        for bytes in [
            minimal(),
            infinite_loop(),
            memory_hog(),
            call_host_eval(),
            call_host_spawn(),
        ] {
            assert_eq!(&bytes[..4], b"\0asm");
            assert_eq!(&bytes[4..8], &[1, 0, 0, 0]);
        }
    }
}
