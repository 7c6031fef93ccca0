use super::AcpiTable;

/// Compute the checksum of an ACPI table by summing all of its bytes. A table
/// is intact exactly when the sum is zero.
pub unsafe fn acpi_table_checksum<T: AcpiTable>(table: &T) -> u8 {
    let bytes = table as *const T as *const u8;
    let mut sum: u8 = 0;
    for i in 0..table.length() {
        sum = sum.wrapping_add(bytes.add(i).read());
    }
    sum
}
