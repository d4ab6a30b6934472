// Hard caps that keep one tenant from exhausting memory or the WAL.

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 64;

pub const MAX_EMPLOYEES_PER_TENANT: usize = 10_000;
pub const MAX_MEMBERS_PER_TENANT: usize = 1_000_000;
pub const MAX_NAME_LEN: usize = 256;

pub const MAX_TIMETABLES_PER_EMPLOYEE: usize = 1_000;
pub const MAX_APPOINTMENTS_PER_EMPLOYEE_DAY: usize = 200;

pub const MAX_BATCH_SIZE: usize = 100;
pub const MAX_REMARKS_LEN: usize = 2_000;
