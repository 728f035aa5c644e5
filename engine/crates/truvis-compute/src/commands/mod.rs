pub mod command_list;
pub mod command_queue;
pub mod timestamp;
pub mod work_tracker;
