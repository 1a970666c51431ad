pub const PIT_FREQ: u32 = 1_193_182;
pub const PIT_CH0: u16 = 0x40;
pub const PIT_CMD: u16 = 0x43;