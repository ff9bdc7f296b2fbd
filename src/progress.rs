/* Progress-step layout for the update pipeline. The core does not
 * measure progress; it only publishes these weights for the shell
 * to divide its bar by. */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStatus {
    Decompressing,
    DeviceRestart,
    DeviceWrite,
    DeviceBusy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressStep {
    pub id: &'static str,
    pub weight: u8,
    pub status: ProgressStatus,
}

pub const UPDATE_PROGRESS_STEPS: [ProgressStep; 5] = [
    ProgressStep {
        id: "prepare-fw",
        weight: 0,
        status: ProgressStatus::Decompressing,
    },
    ProgressStep {
        id: "detach",
        weight: 3,
        status: ProgressStatus::DeviceRestart,
    },
    ProgressStep {
        id: "write",
        weight: 88,
        status: ProgressStatus::DeviceWrite,
    },
    ProgressStep {
        id: "attach",
        weight: 7,
        status: ProgressStatus::DeviceRestart,
    },
    ProgressStep {
        id: "reload",
        weight: 2,
        status: ProgressStatus::DeviceBusy,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_sum_to_one_hundred() {
        let total: u32 = UPDATE_PROGRESS_STEPS
            .iter()
            .map(|s| u32::from(s.weight))
            .sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn write_dominates_the_pipeline() {
        let write = UPDATE_PROGRESS_STEPS
            .iter()
            .find(|s| s.id == "write")
            .unwrap();
        assert_eq!(write.weight, 88);
        assert_eq!(write.status, ProgressStatus::DeviceWrite);
    }
}
