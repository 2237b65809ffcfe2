//! Logical variable names on the machine controller.
//!
//! These are the exact names the PLC program exposes; the concrete address
//! scheme (namespace, node ids) is the client's concern.

// Written by the runtime.
pub const START_UP: &str = "StartUp";
pub const LAY_SURFACE: &str = "LaySurface";
pub const LAY_STACKS: &str = "Lay_Stacks";
pub const STEP_SOURCE: &str = "Step_Source";
pub const STEP_SINK: &str = "Step_Sink";
pub const Z_STACKS: &str = "Z_Stacks";
pub const DELTA_SOURCE: &str = "Delta_Source";
pub const DELTA_SINK: &str = "Delta_Sink";
pub const START_SURFACES: &str = "StartSurfaces";

// Read by the runtime.
pub const MAKE_SURFACE_DONE: &str = "MakeSurface_Done";
pub const START_UP_DONE: &str = "StartUp_Done";
pub const LAY_SURFACE_DONE: &str = "LaySurface_Done";
pub const SOURCE_CYLINDER_POSITION: &str = "Marcer_Source_Cylinder_ActualPosition";
pub const SINK_CYLINDER_POSITION: &str = "Marcer_Sink_Cylinder_ActualPosition";
