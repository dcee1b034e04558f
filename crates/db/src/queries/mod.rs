pub mod bookings;
pub mod failures;
pub mod leads;
pub mod payments;
pub mod records;
