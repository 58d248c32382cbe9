pub mod vton_checkpoint;

pub use vton_checkpoint::{
    load_state_dict, save_checkpoint, CheckpointError, LoadReport, GARM_PREFIX, VTON_PREFIX,
};
