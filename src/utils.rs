use tch::{Device, Kind, Tensor};

pub fn get_device() -> Device {
    if tch::utils::has_mps() {
        Device::Mps
    } else {
        Device::cuda_if_available()
    }
}

pub fn has_nan(xs: &Tensor) -> bool {
    count_nan(xs) > 0
}

pub fn count_nan(xs: &Tensor) -> i64 {
    xs.isnan().sum(Kind::Int64).int64_value(&[])
}
