//! Device control requests clients may pass through to the driver.

/// A permitted V4L2 request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoctlPermission {
    pub request: u32,
    pub name: &'static str,
    /// Changes the tuned channel or norm; needs channel control.
    pub changes_channel: bool,
}

const fn query(request: u32, name: &'static str) -> IoctlPermission {
    IoctlPermission {
        request,
        name,
        changes_channel: false,
    }
}

const fn switch(request: u32, name: &'static str) -> IoctlPermission {
    IoctlPermission {
        request,
        name,
        changes_channel: true,
    }
}

pub const V4L2_IOCTLS: &[IoctlPermission] = &[
    query(0x8068_5600, "VIDIOC_QUERYCAP"),
    query(0xc048_5619, "VIDIOC_ENUMSTD"),
    query(0x8008_5617, "VIDIOC_G_STD"),
    switch(0x4008_5618, "VIDIOC_S_STD"),
    query(0xc050_561a, "VIDIOC_ENUMINPUT"),
    query(0x8004_5626, "VIDIOC_G_INPUT"),
    switch(0xc004_5627, "VIDIOC_S_INPUT"),
    query(0xc054_561d, "VIDIOC_G_TUNER"),
    switch(0x4054_561e, "VIDIOC_S_TUNER"),
    query(0xc02c_5638, "VIDIOC_G_FREQUENCY"),
    switch(0x402c_5639, "VIDIOC_S_FREQUENCY"),
    query(0x8008_563f, "VIDIOC_QUERYSTD"),
    query(0x8034_5621, "VIDIOC_G_AUDIO"),
    query(0x4034_5622, "VIDIOC_S_AUDIO"),
];

pub fn lookup(request: u32) -> Option<&'static IoctlPermission> {
    V4L2_IOCTLS.iter().find(|p| p.request == request)
}

/// Argument size encoded in a Linux ioctl request number.
pub fn arg_size(request: u32) -> usize {
    ((request >> 16) & 0x3fff) as usize
}
