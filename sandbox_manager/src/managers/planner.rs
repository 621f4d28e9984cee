use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    resources::{GpuInfo, HostSnapshot, PortForwarding, ResourceSpec},
    virtual_disk::DiskFunction,
};

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum PlannerError {
    #[error("Invalid host snapshot: {0}")]
    InvalidSnapshot(String),
    #[error("No host drive holds storage directory: {0:?}")]
    UnknownDrive(PathBuf),
}

/// Resources that always stay with the host operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMargin {
    pub processors: u32,
    pub memory_gb: u32,
    pub disk_gb: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    pub processors: u32,
    pub memory_gb: u32,
    pub os_disk_gb: u32,
    pub cluster_disk_gb: u32,
    pub data_disk_gb: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerPolicy {
    pub margin: HostMargin,
    pub minimum: Tier,
    pub recommended: Tier,
    pub ports: PortForwarding,
}

impl Default for PlannerPolicy {
    fn default() -> Self {
        Self {
            margin: HostMargin {
                processors: 2,
                memory_gb: 4,
                disk_gb: 10,
            },
            minimum: Tier {
                processors: 2,
                memory_gb: 4,
                os_disk_gb: 5,
                cluster_disk_gb: 10,
                data_disk_gb: 10,
            },
            recommended: Tier {
                processors: 4,
                memory_gb: 8,
                os_disk_gb: 10,
                cluster_disk_gb: 25,
                data_disk_gb: 50,
            },
            ports: PortForwarding::default(),
        }
    }
}

/// Directories that will hold each disk of a machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePlacement {
    pub os_dir: PathBuf,
    pub cluster_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl StoragePlacement {
    pub fn dir(&self, function: DiskFunction) -> &Path {
        match function {
            DiskFunction::Os => &self.os_dir,
            DiskFunction::Cluster => &self.cluster_dir,
            DiskFunction::Data => &self.data_dir,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceDimension {
    Memory,
    Processors,
    Disk(PathBuf),
    Gpu(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{reason}")]
pub struct Infeasibility {
    pub dimension: ResourceDimension,
    pub shortfall: u64,
    pub reason: String,
}

pub type Feasibility = Result<(), Infeasibility>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePlan {
    pub minimum: ResourceSpec,
    pub recommended: ResourceSpec,
    pub maximum: ResourceSpec,
    pub minimum_feasible: bool,
    pub minimum_reason: Option<String>,
    pub recommended_feasible: bool,
    pub recommended_reason: Option<String>,
}

struct Budget {
    processors: i64,
    memory_gb: i64,
    drives: BTreeMap<PathBuf, i64>,
    free_gpus: Vec<GpuInfo>,
}

pub struct ResourcePlanner {
    policy: PlannerPolicy,
}

impl ResourcePlanner {
    pub fn new(policy: PlannerPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PlannerPolicy {
        &self.policy
    }

    /// Computes the three tiers for a new machine whose disks go to `placement`.
    /// `committed` are the shapes of every instance currently starting or running.
    pub fn plan(
        &self,
        snapshot: &HostSnapshot,
        committed: &[ResourceSpec],
        placement: &StoragePlacement,
        preferred_gpu_model: Option<&str>,
    ) -> Result<ResourcePlan, PlannerError> {
        let budget = self.budget(snapshot, committed)?;
        let maximum = self.maximum(snapshot, &budget, placement, preferred_gpu_model)?;

        let minimum = self.tier_spec(&self.policy.minimum, &maximum, false);
        let recommended = self.tier_spec(&self.policy.recommended, &maximum, true);
        let minimum_check = Self::check_budget(
            &budget,
            &self.policy.margin,
            &minimum,
            Some(&Self::disk_demand(snapshot, &minimum, placement)?),
        );
        let recommended_check = Self::check_budget(
            &budget,
            &self.policy.margin,
            &recommended,
            Some(&Self::disk_demand(snapshot, &recommended, placement)?),
        );

        Ok(ResourcePlan {
            minimum: Self::clamp_to(minimum, &maximum),
            recommended: Self::clamp_to(recommended, &maximum),
            maximum,
            minimum_feasible: minimum_check.is_ok(),
            minimum_reason: minimum_check.err().map(|infeasibility| infeasibility.reason),
            recommended_feasible: recommended_check.is_ok(),
            recommended_reason: recommended_check.err().map(|infeasibility| infeasibility.reason),
        })
    }

    /// Checks one concrete shape. Disks are only accounted for when a placement
    /// is given: the disks of an existing machine already occupy their drive.
    pub fn check(
        &self,
        snapshot: &HostSnapshot,
        committed: &[ResourceSpec],
        spec: &ResourceSpec,
        placement: Option<&StoragePlacement>,
    ) -> Result<Feasibility, PlannerError> {
        let budget = self.budget(snapshot, committed)?;
        let demand = match placement {
            Some(placement) => Some(Self::disk_demand(snapshot, spec, placement)?),
            None => None,
        };
        Ok(Self::check_budget(
            &budget,
            &self.policy.margin,
            spec,
            demand.as_ref(),
        ))
    }

    /// Checks only the drives: `growth` holds the additional gigabytes per disk.
    pub fn check_disk_growth(
        &self,
        snapshot: &HostSnapshot,
        growth: &ResourceSpec,
        placement: &StoragePlacement,
    ) -> Result<Feasibility, PlannerError> {
        let budget = self.budget(snapshot, &[])?;
        let demand = Self::disk_demand(snapshot, growth, placement)?;
        Ok(Self::check_disks(&budget, &self.policy.margin, &demand))
    }

    /// Lowers the compute part of `spec` to what `maximum` allows and reports
    /// every change that was made.
    pub fn fit_to_maximum(
        &self,
        spec: &ResourceSpec,
        maximum: &ResourceSpec,
    ) -> (ResourceSpec, Vec<String>) {
        let mut granted = spec.clone();
        let mut adjustments = vec![];
        if granted.processors > maximum.processors {
            adjustments.push(format!(
                "Processors reduced from {} to {} because of host pressure.",
                granted.processors, maximum.processors
            ));
            granted.processors = maximum.processors;
        }
        if granted.memory_gb > maximum.memory_gb {
            adjustments.push(format!(
                "Memory reduced from {} GB to {} GB because of host pressure.",
                granted.memory_gb, maximum.memory_gb
            ));
            granted.memory_gb = maximum.memory_gb;
        }
        if granted.uses_gpu() && granted.gpu_model != maximum.gpu_model {
            adjustments.push(format!(
                "GPU {} is not available, starting without GPU.",
                granted.gpu_model.as_deref().unwrap_or_default()
            ));
            granted.gpu_model = None;
            granted.gpu_memory_gb = 0;
            granted.gpu_count = 0;
        }
        (granted, adjustments)
    }

    fn validate(&self, snapshot: &HostSnapshot) -> Result<(), PlannerError> {
        let reserved = self.policy.margin.processors;
        if snapshot.logical_processors == 0 {
            Err(PlannerError::InvalidSnapshot(
                "host reports no logical processors".to_string(),
            ))
        } else if snapshot.logical_processors < reserved {
            Err(PlannerError::InvalidSnapshot(format!(
                "host reports {} logical processors, fewer than the {} kept for the host",
                snapshot.logical_processors, reserved
            )))
        } else if snapshot.total_memory_mb == 0 {
            Err(PlannerError::InvalidSnapshot(
                "host reports no memory".to_string(),
            ))
        } else if snapshot.free_memory_mb > snapshot.total_memory_mb {
            Err(PlannerError::InvalidSnapshot(format!(
                "free memory {} MB exceeds total memory {} MB",
                snapshot.free_memory_mb, snapshot.total_memory_mb
            )))
        } else if snapshot.drives.is_empty() {
            Err(PlannerError::InvalidSnapshot(
                "host reports no drives".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn budget(
        &self,
        snapshot: &HostSnapshot,
        committed: &[ResourceSpec],
    ) -> Result<Budget, PlannerError> {
        self.validate(snapshot)?;
        let margin = &self.policy.margin;
        let committed_processors: i64 = committed.iter().map(|spec| i64::from(spec.processors)).sum();
        let committed_memory_gb: i64 = committed.iter().map(|spec| i64::from(spec.memory_gb)).sum();
        let total_memory_gb = (snapshot.total_memory_mb / 1024) as i64;
        let free_memory_gb = (snapshot.free_memory_mb / 1024) as i64;

        let mut free_gpus = snapshot.gpus.clone();
        for spec in committed.iter().filter(|spec| spec.uses_gpu()) {
            for _ in 0..spec.gpu_count {
                if let Some(position) = free_gpus
                    .iter()
                    .position(|gpu| Some(&gpu.model_name) == spec.gpu_model.as_ref())
                {
                    free_gpus.remove(position);
                }
            }
        }

        Ok(Budget {
            processors: i64::from(snapshot.logical_processors)
                - i64::from(margin.processors)
                - committed_processors,
            memory_gb: (total_memory_gb - committed_memory_gb).min(free_memory_gb)
                - i64::from(margin.memory_gb),
            drives: snapshot
                .drives
                .iter()
                .map(|drive| {
                    (
                        drive.path.clone(),
                        (drive.free_space_mb / 1024) as i64 - i64::from(margin.disk_gb),
                    )
                })
                .collect(),
            free_gpus,
        })
    }

    fn drive_of(snapshot: &HostSnapshot, dir: &Path) -> Result<PathBuf, PlannerError> {
        snapshot
            .drive_for(dir)
            .map(|drive| drive.path.clone())
            .ok_or_else(|| PlannerError::UnknownDrive(dir.to_path_buf()))
    }

    fn disk_demand(
        snapshot: &HostSnapshot,
        spec: &ResourceSpec,
        placement: &StoragePlacement,
    ) -> Result<BTreeMap<PathBuf, i64>, PlannerError> {
        let mut demand = BTreeMap::new();
        for function in DiskFunction::ALL {
            let drive = Self::drive_of(snapshot, placement.dir(function))?;
            *demand.entry(drive).or_insert(0) += i64::from(spec.disk_size_gb(function));
        }
        Ok(demand)
    }

    fn check_budget(
        budget: &Budget,
        margin: &HostMargin,
        spec: &ResourceSpec,
        disk_demand: Option<&BTreeMap<PathBuf, i64>>,
    ) -> Feasibility {
        let required_memory = i64::from(spec.memory_gb);
        if required_memory > budget.memory_gb {
            let shortfall = required_memory - budget.memory_gb;
            return Err(Infeasibility {
                dimension: ResourceDimension::Memory,
                shortfall: shortfall as u64,
                reason: format!(
                    "Not enough memory: {} GB required and {} GB reserved for the host, but only {} GB available ({} GB missing).",
                    required_memory,
                    margin.memory_gb,
                    (budget.memory_gb + i64::from(margin.memory_gb)).max(0),
                    shortfall
                ),
            });
        }

        let required_processors = i64::from(spec.processors);
        if required_processors > budget.processors {
            let shortfall = required_processors - budget.processors;
            return Err(Infeasibility {
                dimension: ResourceDimension::Processors,
                shortfall: shortfall as u64,
                reason: format!(
                    "Not enough processors: {} required and {} reserved for the host, but only {} available ({} missing).",
                    required_processors,
                    margin.processors,
                    (budget.processors + i64::from(margin.processors)).max(0),
                    shortfall
                ),
            });
        }

        if let Some(disk_demand) = disk_demand {
            Self::check_disks(budget, margin, disk_demand)?;
        }

        if let (Some(model), true) = (spec.gpu_model.as_ref(), spec.gpu_count > 0) {
            let matching = budget
                .free_gpus
                .iter()
                .filter(|gpu| &gpu.model_name == model)
                .filter(|gpu| gpu.memory_mb / 1024 >= u64::from(spec.gpu_memory_gb))
                .count() as u64;
            if matching < u64::from(spec.gpu_count) {
                let shortfall = u64::from(spec.gpu_count) - matching;
                return Err(Infeasibility {
                    dimension: ResourceDimension::Gpu(model.clone()),
                    shortfall,
                    reason: format!(
                        "GPU {} is unavailable: {} required, {} free ({} missing).",
                        model, spec.gpu_count, matching, shortfall
                    ),
                });
            }
        }
        Ok(())
    }

    fn check_disks(
        budget: &Budget,
        margin: &HostMargin,
        disk_demand: &BTreeMap<PathBuf, i64>,
    ) -> Feasibility {
        for (drive, required_gb) in disk_demand {
            let available_gb = budget.drives.get(drive).copied().unwrap_or_default();
            if *required_gb > available_gb {
                let shortfall = required_gb - available_gb;
                return Err(Infeasibility {
                    dimension: ResourceDimension::Disk(drive.clone()),
                    shortfall: shortfall as u64,
                    reason: format!(
                        "Not enough disk space on {}: {} GB required and {} GB reserved for the host, but only {} GB free ({} GB missing).",
                        drive.display(),
                        required_gb,
                        margin.disk_gb,
                        (available_gb + i64::from(margin.disk_gb)).max(0),
                        shortfall
                    ),
                });
            }
        }
        Ok(())
    }

    fn maximum(
        &self,
        snapshot: &HostSnapshot,
        budget: &Budget,
        placement: &StoragePlacement,
        preferred_gpu_model: Option<&str>,
    ) -> Result<ResourceSpec, PlannerError> {
        let clamp = |value: i64| value.clamp(0, i64::from(u32::MAX)) as u32;
        let mut maximum = ResourceSpec {
            processors: clamp(budget.processors),
            memory_gb: clamp(budget.memory_gb),
            gpu_model: None,
            gpu_memory_gb: 0,
            gpu_count: 0,
            os_disk_gb: 0,
            cluster_disk_gb: 0,
            data_disk_gb: 0,
            os_disk_is_ssd: false,
            cluster_disk_is_ssd: false,
            data_disk_is_ssd: false,
            ports: self.policy.ports,
        };

        // Os and Cluster disks are capped at the recommended size, Data takes what is left.
        let mut remaining = budget.drives.clone();
        for function in DiskFunction::ALL {
            let drive = Self::drive_of(snapshot, placement.dir(function))?;
            let available = remaining.get(&drive).copied().unwrap_or_default().max(0);
            let size = match function {
                DiskFunction::Os => available.min(i64::from(self.policy.recommended.os_disk_gb)),
                DiskFunction::Cluster => {
                    available.min(i64::from(self.policy.recommended.cluster_disk_gb))
                }
                DiskFunction::Data => available,
            };
            remaining.insert(drive.clone(), available - size);
            maximum.set_disk_size_gb(function, clamp(size));
            maximum.set_disk_is_ssd(
                function,
                snapshot
                    .drive_for(placement.dir(function))
                    .map(|drive| drive.is_ssd)
                    .unwrap_or_default(),
            );
        }

        let gpu = match preferred_gpu_model {
            Some(model) => budget.free_gpus.iter().find(|gpu| gpu.model_name == model),
            None => budget.free_gpus.first(),
        };
        if let Some(gpu) = gpu {
            maximum.gpu_model = Some(gpu.model_name.clone());
            maximum.gpu_memory_gb = (gpu.memory_mb / 1024) as u32;
            maximum.gpu_count = 1;
        }
        Ok(maximum)
    }

    fn tier_spec(&self, tier: &Tier, maximum: &ResourceSpec, with_gpu: bool) -> ResourceSpec {
        let mut spec = maximum.clone();
        spec.processors = tier.processors;
        spec.memory_gb = tier.memory_gb;
        spec.os_disk_gb = tier.os_disk_gb;
        spec.cluster_disk_gb = tier.cluster_disk_gb;
        spec.data_disk_gb = tier.data_disk_gb;
        if !with_gpu {
            spec.gpu_model = None;
            spec.gpu_memory_gb = 0;
            spec.gpu_count = 0;
        }
        spec
    }

    fn clamp_to(mut spec: ResourceSpec, maximum: &ResourceSpec) -> ResourceSpec {
        spec.processors = spec.processors.min(maximum.processors);
        spec.memory_gb = spec.memory_gb.min(maximum.memory_gb);
        spec.os_disk_gb = spec.os_disk_gb.min(maximum.os_disk_gb);
        spec.cluster_disk_gb = spec.cluster_disk_gb.min(maximum.cluster_disk_gb);
        spec.data_disk_gb = spec.data_disk_gb.min(maximum.data_disk_gb);
        spec
    }
}

impl Default for ResourcePlanner {
    fn default() -> Self {
        Self::new(PlannerPolicy::default())
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use parameterized::parameterized;

    use super::{PlannerError, ResourceDimension, ResourcePlanner, StoragePlacement};
    use crate::managers::resources::{DriveInfo, GpuInfo, HostSnapshot};
    use crate::utils::test_utilities::{create_example_placement, create_example_spec};

    fn create_snapshot(processors: u32, memory_gb: u64, disk_gb: u64) -> HostSnapshot {
        HostSnapshot {
            logical_processors: processors,
            total_memory_mb: memory_gb * 1024,
            free_memory_mb: memory_gb * 1024,
            drives: vec![DriveInfo {
                path: PathBuf::from("/"),
                free_space_mb: disk_gb * 1024,
                is_ssd: true,
            }],
            gpus: vec![],
        }
    }

    #[test]
    fn plan_for_common_laptop() {
        let planner = ResourcePlanner::default();
        let plan = planner
            .plan(&create_snapshot(8, 16, 500), &[], &create_example_placement(), None)
            .unwrap();

        assert!(plan.recommended_feasible);
        assert!(plan.recommended.processors <= 6);
        assert!(plan.recommended.memory_gb <= 12);
        assert!(plan.minimum_feasible);
        assert!(plan.minimum.processors < plan.recommended.processors);
        assert!(plan.minimum.memory_gb < plan.recommended.memory_gb);
        assert_eq!(plan.maximum.processors, 6);
        assert_eq!(plan.maximum.memory_gb, 12);
        assert!(plan.maximum.data_disk_is_ssd);
        assert_eq!(plan.maximum.gpu_model, None);
    }

    #[parameterized(memory_gb = {1, 4, 7})]
    fn minimum_infeasible_when_memory_is_short(memory_gb: u64) {
        let planner = ResourcePlanner::default();
        let plan = planner
            .plan(
                &create_snapshot(4, memory_gb, 500),
                &[],
                &create_example_placement(),
                None,
            )
            .unwrap();
        assert!(!plan.minimum_feasible);
        assert!(plan.minimum_reason.unwrap().contains("memory"));
    }

    #[parameterized(processors = {2, 3, 8, 64})]
    fn maximum_never_eats_host_margin(processors: u32) {
        let planner = ResourcePlanner::default();
        let plan = planner
            .plan(
                &create_snapshot(processors, 32, 500),
                &[],
                &create_example_placement(),
                None,
            )
            .unwrap();
        assert!(plan.maximum.processors + planner.policy().margin.processors <= processors);
    }

    #[test]
    fn committed_resources_are_subtracted() {
        let planner = ResourcePlanner::default();
        let mut running = create_example_spec();
        running.processors = 4;
        running.memory_gb = 8;
        let plan = planner
            .plan(
                &create_snapshot(8, 16, 500),
                &[running],
                &create_example_placement(),
                None,
            )
            .unwrap();
        assert_eq!(plan.maximum.processors, 2);
        assert_eq!(plan.maximum.memory_gb, 4);
        assert!(plan.minimum_feasible);
        assert!(!plan.recommended_feasible);
        assert!(plan.recommended_reason.unwrap().contains("memory"));
    }

    #[test]
    fn check_names_first_failing_dimension_with_shortfall() {
        let planner = ResourcePlanner::default();
        let mut spec = create_example_spec();
        spec.processors = 10;
        spec.memory_gb = 4;
        let infeasibility = planner
            .check(&create_snapshot(8, 16, 500), &[], &spec, None)
            .unwrap()
            .unwrap_err();
        assert_eq!(infeasibility.dimension, ResourceDimension::Processors);
        assert_eq!(infeasibility.shortfall, 4);
        assert!(infeasibility.reason.contains("4 missing"));
    }

    #[test]
    fn disks_sharing_a_drive_are_summed() {
        let planner = ResourcePlanner::default();
        let mut spec = create_example_spec();
        spec.os_disk_gb = 20;
        spec.cluster_disk_gb = 20;
        spec.data_disk_gb = 20;
        let infeasibility = planner
            .check(
                &create_snapshot(8, 16, 60),
                &[],
                &spec,
                Some(&create_example_placement()),
            )
            .unwrap()
            .unwrap_err();
        assert_eq!(
            infeasibility.dimension,
            ResourceDimension::Disk(PathBuf::from("/"))
        );
        assert_eq!(infeasibility.shortfall, 10);
    }

    #[test]
    fn existing_machine_disks_are_not_recounted() {
        let planner = ResourcePlanner::default();
        let mut spec = create_example_spec();
        spec.data_disk_gb = 1000;
        assert_eq!(
            planner.check(&create_snapshot(8, 16, 60), &[], &spec, None),
            Ok(Ok(()))
        );
    }

    #[test]
    fn disk_growth_ignores_memory_pressure() {
        let planner = ResourcePlanner::default();
        let mut growth = create_example_spec();
        growth.os_disk_gb = 0;
        growth.cluster_disk_gb = 0;
        growth.data_disk_gb = 40;
        let snapshot = create_snapshot(2, 2, 60);
        assert_eq!(
            planner.check_disk_growth(&snapshot, &growth, &create_example_placement()),
            Ok(Ok(()))
        );
        growth.data_disk_gb = 60;
        let infeasibility = planner
            .check_disk_growth(&snapshot, &growth, &create_example_placement())
            .unwrap()
            .unwrap_err();
        assert_eq!(infeasibility.shortfall, 10);
    }

    #[test]
    fn gpu_selection_is_sticky() {
        let planner = ResourcePlanner::default();
        let mut snapshot = create_snapshot(8, 32, 500);
        snapshot.gpus = vec![
            GpuInfo {
                model_name: "RTX 3060".to_string(),
                memory_mb: 12 * 1024,
            },
            GpuInfo {
                model_name: "RTX 4090".to_string(),
                memory_mb: 24 * 1024,
            },
        ];
        let placement = create_example_placement();

        let plan = planner.plan(&snapshot, &[], &placement, None).unwrap();
        assert_eq!(plan.maximum.gpu_model.as_deref(), Some("RTX 3060"));
        assert_eq!(plan.recommended.gpu_model.as_deref(), Some("RTX 3060"));
        assert_eq!(plan.minimum.gpu_model, None);

        let plan = planner
            .plan(&snapshot, &[], &placement, Some("RTX 4090"))
            .unwrap();
        assert_eq!(plan.maximum.gpu_model.as_deref(), Some("RTX 4090"));
        assert_eq!(plan.maximum.gpu_memory_gb, 24);

        let mut running = create_example_spec();
        running.gpu_model = Some("RTX 4090".to_string());
        running.gpu_count = 1;
        let plan = planner
            .plan(&snapshot, &[running], &placement, Some("RTX 4090"))
            .unwrap();
        assert_eq!(plan.maximum.gpu_model, None);
    }

    #[test]
    fn missing_gpu_model_is_infeasible() {
        let planner = ResourcePlanner::default();
        let mut spec = create_example_spec();
        spec.gpu_model = Some("RTX 4090".to_string());
        spec.gpu_count = 1;
        let infeasibility = planner
            .check(&create_snapshot(8, 16, 500), &[], &spec, None)
            .unwrap()
            .unwrap_err();
        assert_eq!(
            infeasibility.dimension,
            ResourceDimension::Gpu("RTX 4090".to_string())
        );
        assert_eq!(infeasibility.shortfall, 1);
    }

    #[test]
    fn invalid_snapshot_is_an_error() {
        let planner = ResourcePlanner::default();
        let mut snapshot = create_snapshot(8, 16, 500);
        snapshot.free_memory_mb = snapshot.total_memory_mb + 1;
        assert!(matches!(
            planner.plan(&snapshot, &[], &create_example_placement(), None),
            Err(PlannerError::InvalidSnapshot(_))
        ));
        snapshot = create_snapshot(0, 16, 500);
        assert!(matches!(
            planner.plan(&snapshot, &[], &create_example_placement(), None),
            Err(PlannerError::InvalidSnapshot(_))
        ));
    }

    #[parameterized(processors = {0, 1})]
    fn host_smaller_than_margin_is_rejected(processors: u32) {
        let planner = ResourcePlanner::default();
        assert!(processors < planner.policy().margin.processors);
        assert!(matches!(
            planner.plan(
                &create_snapshot(processors, 32, 500),
                &[],
                &create_example_placement(),
                None
            ),
            Err(PlannerError::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn storage_outside_known_drives_is_an_error() {
        let planner = ResourcePlanner::default();
        let mut snapshot = create_snapshot(8, 16, 500);
        snapshot.drives[0].path = PathBuf::from("/mnt/other");
        assert_eq!(
            planner.plan(&snapshot, &[], &create_example_placement(), None),
            Err(PlannerError::UnknownDrive(create_example_placement().os_dir))
        );
    }

    #[test]
    fn fit_to_maximum_reports_reductions() {
        let planner = ResourcePlanner::default();
        let mut spec = create_example_spec();
        spec.processors = 8;
        spec.memory_gb = 16;
        let mut maximum = create_example_spec();
        maximum.processors = 6;
        maximum.memory_gb = 12;
        let (granted, adjustments) = planner.fit_to_maximum(&spec, &maximum);
        assert_eq!(granted.processors, 6);
        assert_eq!(granted.memory_gb, 12);
        assert_eq!(adjustments.len(), 2);
    }

    #[test]
    fn placement_dir_matches_function() {
        let placement = StoragePlacement {
            os_dir: PathBuf::from("/os"),
            cluster_dir: PathBuf::from("/cluster"),
            data_dir: PathBuf::from("/data"),
        };
        assert_eq!(
            placement.dir(crate::managers::virtual_disk::DiskFunction::Cluster),
            PathBuf::from("/cluster").as_path()
        );
    }
}
