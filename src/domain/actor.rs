use serde::{Deserialize, Serialize};
use std::fmt;

/// Institutional roles as resolved by the external auth context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRole {
    /// Lecturer; owns and submits proposals.
    GiangVien,
    /// Faculty-level research manager.
    QuanLyKhoa,
    /// School science-and-technology office.
    PhongKhcn,
    /// Board of rectors.
    BanGiamHoc,
    /// External council reviewer.
    HoiDong,
}

impl UserRole {
    /// Roles that may act inside a council (open, draft, submit, finalize).
    pub const COUNCIL_CAPABLE: [UserRole; 4] = [
        UserRole::GiangVien,
        UserRole::QuanLyKhoa,
        UserRole::BanGiamHoc,
        UserRole::HoiDong,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::GiangVien => "GIANG_VIEN",
            UserRole::QuanLyKhoa => "QUAN_LY_KHOA",
            UserRole::PhongKhcn => "PHONG_KHCN",
            UserRole::BanGiamHoc => "BAN_GIAM_HOC",
            UserRole::HoiDong => "HOI_DONG",
        }
    }

    pub fn can_sit_on_council(&self) -> bool {
        Self::COUNCIL_CAPABLE.contains(self)
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The caller of an operation. Always passed explicitly, never read from ambient state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: UserRole,
    #[serde(default)]
    pub faculty_id: Option<String>,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: UserRole) -> Self {
        Self {
            id: id.into(),
            role,
            faculty_id: None,
        }
    }

    pub fn with_faculty(mut self, faculty_id: impl Into<String>) -> Self {
        self.faculty_id = Some(faculty_id.into());
        self
    }

    pub fn belongs_to_faculty(&self, faculty_id: &str) -> bool {
        self.faculty_id.as_deref() == Some(faculty_id)
    }
}
