pub mod execution_unit;
pub mod issue_queue;
pub mod reorder_buffer;
pub mod reservation_station;
