//! The kernel's single failure mode: every violated invariant panics, the
//! panic raises the fatal software interrupt, and its ISR stops the CPU.

#[cfg(not(test))]
use core::fmt::Write;
#[cfg(not(test))]
use core::panic::PanicInfo;

#[cfg(not(test))]
#[panic_handler]
fn panic(panic_info: &PanicInfo) -> ! {
    // The global logger may be locked mid-write by the code that panicked.
    // The machine is going down anyway, so grab a fresh handle to the port
    // and get the message out.
    let mut com1 = unsafe { amd64::io::com::SerialPort::new(amd64::io::com::COM1_ADDR) };
    writeln!(com1, "kernel panic: {}", panic_info).unwrap_or(());

    unsafe { amd64::fatal() }
}
