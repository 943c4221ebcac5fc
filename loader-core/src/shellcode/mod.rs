//! Interception stub generation.
//!
//! A stub is what an import slot points at while it is hooked. It:
//! 1. Preserves every volatile register (and the SSE argument registers on x64)
//! 2. Optionally records which target fired into the two entry marker cells
//! 3. Calls `callback(context)`
//! 4. Restores registers and stack exactly as they were on entry
//! 5. Jumps to the original function, which sees the caller's arguments untouched

use crate::error::HookError;

/// Entry marker write performed before the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerStore {
    /// Address of two consecutive `i32` cells.
    pub cells: usize,
    pub module_ordinal: i32,
    pub export_ordinal: i32,
}

/// Everything baked into one stub.
#[derive(Debug, Clone, Copy)]
pub struct StubSpec {
    pub marker: Option<MarkerStore>,
    /// `extern "system" fn(*const c_void)`
    pub callback: usize,
    pub context: usize,
    /// Where to continue once the callback returns.
    pub original: usize,
}

/// Stack bytes reserved on x64: 32 bytes shadow space plus xmm0-xmm5.
const X64_FRAME: u32 = 0x20 + 6 * 16;

/// Generate an x64 stub (Microsoft calling convention).
///
/// Entry stack is 8 mod 16; seven pushes and the frame bring it back to
/// 16-byte alignment for the callback.
pub fn interception_stub_x64(spec: &StubSpec) -> Vec<u8> {
    let mut code = Vec::with_capacity(160);

    code.extend_from_slice(&[
        0x51, // push rcx
        0x52, // push rdx
        0x41, 0x50, // push r8
        0x41, 0x51, // push r9
        0x41, 0x52, // push r10
        0x41, 0x53, // push r11
        0x50, // push rax
    ]);

    // sub rsp, X64_FRAME
    code.extend_from_slice(&[0x48, 0x81, 0xEC]);
    code.extend_from_slice(&X64_FRAME.to_le_bytes());

    // movdqu [rsp + 0x20 + 16*n], xmmN
    for n in 0..6u8 {
        code.extend_from_slice(&[0xF3, 0x0F, 0x7F, 0x44 | (n << 3), 0x24, 0x20 + n * 16]);
    }

    if let Some(marker) = spec.marker {
        code.extend_from_slice(&[0x48, 0xB8]); // movabs rax, cells
        code.extend_from_slice(&(marker.cells as u64).to_le_bytes());
        code.extend_from_slice(&[0xC7, 0x00]); // mov dword [rax], imm32
        code.extend_from_slice(&marker.module_ordinal.to_le_bytes());
        code.extend_from_slice(&[0xC7, 0x40, 0x04]); // mov dword [rax+4], imm32
        code.extend_from_slice(&marker.export_ordinal.to_le_bytes());
    }

    code.extend_from_slice(&[0x48, 0xB9]); // movabs rcx, context
    code.extend_from_slice(&(spec.context as u64).to_le_bytes());
    code.extend_from_slice(&[0x48, 0xB8]); // movabs rax, callback
    code.extend_from_slice(&(spec.callback as u64).to_le_bytes());
    code.extend_from_slice(&[0xFF, 0xD0]); // call rax

    // movdqu xmmN, [rsp + 0x20 + 16*n]
    for n in 0..6u8 {
        code.extend_from_slice(&[0xF3, 0x0F, 0x6F, 0x44 | (n << 3), 0x24, 0x20 + n * 16]);
    }

    // add rsp, X64_FRAME
    code.extend_from_slice(&[0x48, 0x81, 0xC4]);
    code.extend_from_slice(&X64_FRAME.to_le_bytes());

    code.extend_from_slice(&[
        0x58, // pop rax
        0x41, 0x5B, // pop r11
        0x41, 0x5A, // pop r10
        0x41, 0x59, // pop r9
        0x41, 0x58, // pop r8
        0x5A, // pop rdx
        0x59, // pop rcx
    ]);

    // jmp qword [rip+0] followed by the target, so no register is clobbered.
    code.extend_from_slice(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
    code.extend_from_slice(&(spec.original as u64).to_le_bytes());

    code
}

/// Generate an x86 stub. The callback is `stdcall` and pops its argument.
pub fn interception_stub_x86(spec: &StubSpec) -> Vec<u8> {
    let mut code = Vec::with_capacity(48);

    code.extend_from_slice(&[
        0x60, // pushad
        0x9C, // pushfd
    ]);

    if let Some(marker) = spec.marker {
        code.extend_from_slice(&[0xC7, 0x05]); // mov dword [cells], imm32
        code.extend_from_slice(&(marker.cells as u32).to_le_bytes());
        code.extend_from_slice(&marker.module_ordinal.to_le_bytes());
        code.extend_from_slice(&[0xC7, 0x05]); // mov dword [cells+4], imm32
        code.extend_from_slice(&((marker.cells + 4) as u32).to_le_bytes());
        code.extend_from_slice(&marker.export_ordinal.to_le_bytes());
    }

    code.push(0x68); // push context
    code.extend_from_slice(&(spec.context as u32).to_le_bytes());
    code.push(0xB8); // mov eax, callback
    code.extend_from_slice(&(spec.callback as u32).to_le_bytes());
    code.extend_from_slice(&[0xFF, 0xD0]); // call eax

    code.extend_from_slice(&[
        0x9D, // popfd
        0x61, // popad
    ]);

    // push original; ret
    code.push(0x68);
    code.extend_from_slice(&(spec.original as u32).to_le_bytes());
    code.push(0xC3);

    code
}

/// Generate a stub for the architecture this crate is built for.
pub fn interception_stub(spec: &StubSpec) -> Result<Vec<u8>, HookError> {
    #[cfg(target_arch = "x86_64")]
    {
        Ok(interception_stub_x64(spec))
    }

    #[cfg(target_arch = "x86")]
    {
        Ok(interception_stub_x86(spec))
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
    {
        let _ = spec;
        Err(HookError::UnsupportedArchitecture)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(marker: bool) -> StubSpec {
        StubSpec {
            marker: marker.then_some(MarkerStore {
                cells: 0x1122_3344,
                module_ordinal: 3,
                export_ordinal: 9,
            }),
            callback: 0x5566_7788,
            context: 0x0BAD_F00D,
            original: 0x7FFE_0000,
        }
    }

    fn contains(code: &[u8], needle: &[u8]) -> bool {
        code.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn test_x64_stub_shape() {
        let code = interception_stub_x64(&spec(true));

        assert_eq!(code[0], 0x51, "Should start with push rcx");
        // Tail is jmp [rip+0] and the original address.
        let tail = &code[code.len() - 14..];
        assert_eq!(&tail[..6], &[0xFF, 0x25, 0, 0, 0, 0]);
        assert_eq!(&tail[6..], &0x7FFE_0000u64.to_le_bytes());
    }

    #[test]
    fn test_x64_stub_embeds_marker_and_callback() {
        let code = interception_stub_x64(&spec(true));

        let mut cells = vec![0x48, 0xB8];
        cells.extend_from_slice(&0x1122_3344u64.to_le_bytes());
        assert!(contains(&code, &cells));

        assert!(contains(&code, &[0xC7, 0x00, 3, 0, 0, 0]));
        assert!(contains(&code, &[0xC7, 0x40, 0x04, 9, 0, 0, 0]));

        let mut context = vec![0x48, 0xB9];
        context.extend_from_slice(&0x0BAD_F00Du64.to_le_bytes());
        assert!(contains(&code, &context));

        let mut callback = vec![0x48, 0xB8];
        callback.extend_from_slice(&0x5566_7788u64.to_le_bytes());
        callback.extend_from_slice(&[0xFF, 0xD0]);
        assert!(contains(&code, &callback));
    }

    #[test]
    fn test_x64_stub_keeps_stack_balanced() {
        let code = interception_stub_x64(&spec(false));

        let mut sub = vec![0x48, 0x81, 0xEC];
        sub.extend_from_slice(&X64_FRAME.to_le_bytes());
        let mut add = vec![0x48, 0x81, 0xC4];
        add.extend_from_slice(&X64_FRAME.to_le_bytes());
        assert!(contains(&code, &sub));
        assert!(contains(&code, &add));

        // 8 (return address) + 7 pushes + frame must be a multiple of 16.
        assert_eq!((8 + 7 * 8 + X64_FRAME) % 16, 0);
    }

    #[test]
    fn test_marker_is_optional() {
        let with = interception_stub_x64(&spec(true));
        let without = interception_stub_x64(&spec(false));

        assert_eq!(with.len() - without.len(), 10 + 6 + 7);
        assert!(!contains(&without, &[0xC7, 0x00]));
    }

    #[test]
    fn test_x86_stub_shape() {
        let code = interception_stub_x86(&spec(true));

        assert_eq!(&code[..2], &[0x60, 0x9C]);
        assert!(contains(&code, &[0xC7, 0x05, 0x44, 0x33, 0x22, 0x11, 3, 0, 0, 0]));
        assert!(contains(&code, &[0xC7, 0x05, 0x48, 0x33, 0x22, 0x11, 9, 0, 0, 0]));
        assert!(contains(&code, &[0x68, 0x0D, 0xF0, 0xAD, 0x0B]));

        let tail = &code[code.len() - 6..];
        assert_eq!(tail, &[0x68, 0x00, 0x00, 0xFE, 0x7F, 0xC3]);
    }

    #[test]
    #[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
    fn test_native_stub_generation() {
        let code = interception_stub(&spec(true)).unwrap();
        assert!(!code.is_empty());
    }
}
