//! 通用类型定义

use serde::{Deserialize, Serialize};
use strata_errors::{AppError, AppResult};

/// 分页参数（页码从 1 开始）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page_number: u64,
    pub page_size: u64,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page_number: 1,
            page_size: 20,
        }
    }
}

impl PageRequest {
    /// 创建并校验分页参数
    pub fn new(page_number: u64, page_size: u64) -> AppResult<Self> {
        if page_number < 1 {
            return Err(AppError::invalid_argument("page_number must be >= 1"));
        }
        if page_size < 1 {
            return Err(AppError::invalid_argument("page_size must be >= 1"));
        }
        Ok(Self {
            page_number,
            page_size,
        })
    }

    pub fn offset(&self) -> u64 {
        self.page_number.saturating_sub(1).saturating_mul(self.page_size)
    }

    pub fn limit(&self) -> u64 {
        self.page_size
    }
}

/// 分页结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_count: u64,
    pub page_number: u64,
    pub page_size: u64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total_count: u64, request: &PageRequest) -> Self {
        Self {
            items,
            total_count,
            page_number: request.page_number,
            page_size: request.page_size,
        }
    }

    pub fn total_pages(&self) -> u64 {
        if self.page_size == 0 {
            return 0;
        }
        self.total_count.div_ceil(self.page_size)
    }

    pub fn has_previous(&self) -> bool {
        self.page_number > 1
    }

    pub fn has_next(&self) -> bool {
        self.page_number < self.total_pages()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// 转换元素类型，保留分页信息
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total_count: self.total_count,
            page_number: self.page_number,
            page_size: self.page_size,
        }
    }
}
