use amd64::io::com::{SerialPort, COM1_ADDR};
use spinlock::Mutex;

pub static COM1: Mutex<SerialPort> = Mutex::new(unsafe { SerialPort::new(COM1_ADDR) });
