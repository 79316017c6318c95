pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 64;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CONTACT_LEN: usize = 320;
pub const MAX_CANCEL_REASON_LEN: usize = 1_024;
pub const MAX_PREFERENCES_LEN: usize = 16 * 1024;
pub const MAX_PARENTS_PER_BABY: usize = 4;
pub const MAX_APPOINTMENTS_PER_DAY: usize = 2_000;
pub const MAX_CLIENTS: usize = 500_000;
pub const MAX_SESSION_MINUTES: i32 = 8 * 60;
