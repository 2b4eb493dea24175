pub mod management;

pub use management::{CreateTaskRequest, ManagementServer};
