//! The guest entry/exit transition.
//!
//! `kvmx_vmx_transition` is the only code that moves guest general purpose
//! registers in and out of the physical registers. It writes HOST_RSP itself,
//! loads the guest registers, executes VMLAUNCH and, on VM-exit or on a failed
//! entry, stores them back together with CR2. It returns 1 when the entry
//! instruction failed (CF or ZF set, the "below-or-equal" condition) and 0
//! after a regular VM-exit, which clears RFLAGS.
//!
//! Contract: VMCS current on this processor, host interrupts disabled, no
//! migration and no reentry until it returns. HOST_RIP must point at
//! `kvmx_vmexit_trampoline`.
//!
//! VM-exit leaves GDTR/IDTR limits at 0xFFFF and LDTR null, so the host
//! descriptor-table registers are saved on the stack and reloaded afterwards.

use crate::intel::registers::GuestRegisters;

extern "C" {
    /// Enters the guest with the registers in `registers`. Returns non-zero if
    /// the entry itself failed.
    pub fn kvmx_vmx_transition(registers: *mut GuestRegisters) -> u64;

    /// VM-exit landing point; only ever used as an address.
    pub fn kvmx_vmexit_trampoline();
}

core::arch::global_asm!(
    r#"
.set registers_rax, 0x0
.set registers_rcx, 0x8
.set registers_rdx, 0x10
.set registers_rbx, 0x18
.set registers_rsi, 0x20
.set registers_rdi, 0x28
.set registers_rbp, 0x30
.set registers_r8,  0x38
.set registers_r9,  0x40
.set registers_r10, 0x48
.set registers_r11, 0x50
.set registers_r12, 0x58
.set registers_r13, 0x60
.set registers_r14, 0x68
.set registers_r15, 0x70
.set registers_cr2, 0x90

.set host_gdtr, 0x0
.set host_idtr, 0x10
.set host_ldtr, 0x20
.set host_tables_size, 0x28

.set VMCS_HOST_RSP, 0x6C14

.global kvmx_vmx_transition
kvmx_vmx_transition:
    push    rbx
    push    rbp
    push    r12
    push    r13
    push    r14
    push    r15

    sub     rsp, host_tables_size
    sgdt    [rsp + host_gdtr]
    sidt    [rsp + host_idtr]
    sldt    word ptr [rsp + host_ldtr]

    // The register frame pointer sits at HOST_RSP.
    push    rdi
    mov     rax, VMCS_HOST_RSP
    vmwrite rax, rsp

    // Reload CR2 only when it differs.
    mov     rax, [rdi + registers_cr2]
    mov     rdx, cr2
    cmp     rax, rdx
    je      2f
    mov     cr2, rax
2:
    mov     rax, [rdi + registers_rax]
    mov     rcx, [rdi + registers_rcx]
    mov     rdx, [rdi + registers_rdx]
    mov     rbx, [rdi + registers_rbx]
    mov     rsi, [rdi + registers_rsi]
    mov     rbp, [rdi + registers_rbp]
    mov     r8,  [rdi + registers_r8]
    mov     r9,  [rdi + registers_r9]
    mov     r10, [rdi + registers_r10]
    mov     r11, [rdi + registers_r11]
    mov     r12, [rdi + registers_r12]
    mov     r13, [rdi + registers_r13]
    mov     r14, [rdi + registers_r14]
    mov     r15, [rdi + registers_r15]
    mov     rdi, [rdi + registers_rdi]

    vmlaunch

    // A failed VMLAUNCH falls through with the host RSP intact, so both paths
    // share the exit code below. Nothing here may touch RFLAGS before setbe.
.global kvmx_vmexit_trampoline
kvmx_vmexit_trampoline:
    push    rdi
    mov     rdi, [rsp + 0x8]

    mov     [rdi + registers_rax], rax
    mov     [rdi + registers_rcx], rcx
    mov     [rdi + registers_rdx], rdx
    mov     [rdi + registers_rbx], rbx
    mov     [rdi + registers_rsi], rsi
    mov     [rdi + registers_rbp], rbp
    mov     [rdi + registers_r8],  r8
    mov     [rdi + registers_r9],  r9
    mov     [rdi + registers_r10], r10
    mov     [rdi + registers_r11], r11
    mov     [rdi + registers_r12], r12
    mov     [rdi + registers_r13], r13
    mov     [rdi + registers_r14], r14
    mov     [rdi + registers_r15], r15
    pop     rax
    mov     [rdi + registers_rdi], rax
    mov     rax, cr2
    mov     [rdi + registers_cr2], rax

    setbe   al
    movzx   eax, al

    pop     rdi
    lgdt    [rsp + host_gdtr]
    lidt    [rsp + host_idtr]
    lldt    word ptr [rsp + host_ldtr]
    add     rsp, host_tables_size

    pop     r15
    pop     r14
    pop     r13
    pop     r12
    pop     rbp
    pop     rbx
    ret
"#
);
