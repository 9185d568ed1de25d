// Links every module crate so its `inventory::submit!` registration runs
// before `ModuleManager::new` resolves `module.Class` entries. Maintained by
// hand; see the workspace's `modules/` directory for the full set.
#![allow(unused_imports)]

use hw_thermometer as _;
use logic_averager as _;
