use defines::{
    config::{MAX_STACK_SIZE, PAGE_SIZE, STACK_FAULT_SLACK, USER_FRAME_COUNT, USER_POOL_BASE},
    error::{errno, KResult},
};

/// 虚存子系统的运行时配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// 用户页帧池中的帧数
    pub user_frames: usize,
    /// 用户栈最多能增长到多大
    pub max_stack_size: usize,
    /// 栈指针以下多少字节内的访问仍算作栈增长
    pub stack_fault_slack: usize,
    /// 用户页帧池的起始内核地址
    pub frame_base: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_frames: user_frames_from_env(),
            max_stack_size: MAX_STACK_SIZE,
            stack_fault_slack: STACK_FAULT_SLACK,
            frame_base: USER_POOL_BASE,
        }
    }
}

impl VmConfig {
    pub fn validate(&self) -> KResult<()> {
        if self.user_frames == 0
            || self.max_stack_size == 0
            || self.max_stack_size % PAGE_SIZE != 0
            || self.frame_base % PAGE_SIZE != 0
        {
            return Err(errno::EINVAL);
        }
        Ok(())
    }
}

/// 编译期可以用 `KERNEL_USER_FRAMES` 覆盖默认的帧数
fn user_frames_from_env() -> usize {
    option_env!("KERNEL_USER_FRAMES")
        .and_then(|s| s.parse().ok())
        .unwrap_or(USER_FRAME_COUNT)
}
